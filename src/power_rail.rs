use std::io::Result as IoResult;

use crate::error::{ClockError, ConfigError, VoltageError};

/// One independently controllable clock line feeding the gpu.
pub trait ClockDomain: Send {
    fn name(&self) -> &str;
    fn set_rate_hz(&mut self, hz: u64) -> IoResult<()>;
    fn rate_hz(&self) -> IoResult<u64>;
    fn prepare_enable(&mut self) -> IoResult<()>;
    fn disable_unprepare(&mut self);
}

/// Supply regulator of the gpu core, driven in microvolts.
pub trait Regulator: Send {
    fn set_voltage_uv(&mut self, min_uv: u64, max_uv: u64) -> IoResult<()>;
    fn voltage_uv(&self) -> IoResult<u64>;
}

/// The consumer of the clocks, paused around every operating point change.
pub trait DevicePipeline: Send {
    fn pause(&mut self);
    fn resume(&mut self);
}

pub trait TemperatureSensor: Send + Sync {
    fn id(&self) -> u32;
    fn read_temperature(&self) -> IoResult<i64>;
}

/// What `apply_frequency` does when a domain refuses the new rate after
/// earlier domains accepted it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Put the already changed domains back to their previous rate.
    #[default]
    Rollback,
    /// Keep going through every domain and leave whatever state results.
    BestEffort,
}

const HZ_PER_MHZ: u64 = 1_000_000;
const UV_PER_MV: u64 = 1000;

fn hz_to_mhz(hz: u64) -> Result<u32, String> {
    u32::try_from(hz / HZ_PER_MHZ).map_err(|_| format!("rate of {hz} Hz is out of range"))
}

pub struct PowerRail {
    clocks: Vec<Box<dyn ClockDomain>>,
    regulator: Option<Box<dyn Regulator>>,
    pipeline: Box<dyn DevicePipeline>,
    clocks_enabled: bool,
    policy: ApplyPolicy,
}

impl PowerRail {
    pub fn new(
        clocks: Vec<Box<dyn ClockDomain>>,
        regulator: Option<Box<dyn Regulator>>,
        pipeline: Box<dyn DevicePipeline>,
        policy: ApplyPolicy,
    ) -> Result<Self, ConfigError> {
        if clocks.is_empty() {
            return Err(ConfigError::MissingClock("core".to_string()));
        }
        if regulator.is_none() {
            tracing::warn!("no gpu regulator, voltage control unavailable");
        }
        Ok(Self {
            clocks,
            regulator,
            pipeline,
            clocks_enabled: false,
            policy,
        })
    }

    pub fn policy(&self) -> ApplyPolicy {
        self.policy
    }

    pub fn has_regulator(&self) -> bool {
        self.regulator.is_some()
    }

    pub fn clocks_enabled(&self) -> bool {
        self.clocks_enabled
    }

    fn set_rate_error(clock: &dyn ClockDomain, freq_mhz: u32, err: std::io::Error) -> ClockError {
        let current_mhz = clock
            .rate_hz()
            .ok()
            .and_then(|hz| hz_to_mhz(hz).ok())
            .unwrap_or(0);
        ClockError::SetRate {
            domain: clock.name().to_string(),
            requested_mhz: freq_mhz,
            current_mhz,
            reason: err.to_string(),
        }
    }

    /// Sets every clock domain to `freq_mhz`.
    pub fn apply_frequency(&mut self, freq_mhz: u32) -> Result<(), ClockError> {
        tracing::debug!("set_clk_freq({freq_mhz} MHz)");
        let hz = u64::from(freq_mhz) * HZ_PER_MHZ;

        match self.policy {
            ApplyPolicy::BestEffort => {
                let mut first_error = None;
                for clock in &mut self.clocks {
                    if let Err(e) = clock.set_rate_hz(hz) {
                        let err = Self::set_rate_error(&**clock, freq_mhz, e);
                        tracing::error!("{err}");
                        first_error.get_or_insert(err);
                    }
                }
                if let Some(err) = first_error {
                    return Err(err);
                }
            }
            ApplyPolicy::Rollback => {
                let mut previous: Vec<Option<u64>> = Vec::with_capacity(self.clocks.len());
                for i in 0..self.clocks.len() {
                    previous.push(self.clocks[i].rate_hz().ok());
                    if let Err(e) = self.clocks[i].set_rate_hz(hz) {
                        let err = Self::set_rate_error(&*self.clocks[i], freq_mhz, e);
                        tracing::error!("{err}");
                        self.roll_back(&previous[..i]);
                        return Err(err);
                    }
                }
            }
        }

        tracing::debug!("set gpu frequency to {freq_mhz} MHz");
        Ok(())
    }

    fn roll_back(&mut self, previous: &[Option<u64>]) {
        for (clock, rate) in self.clocks.iter_mut().zip(previous).rev() {
            let Some(hz) = rate else {
                tracing::warn!("no previous rate known for {} clock, left as is", clock.name());
                continue;
            };
            if let Err(e) = clock.set_rate_hz(*hz) {
                tracing::error!(
                    "failed to restore {} clock to {} MHz: {e}",
                    clock.name(),
                    hz / HZ_PER_MHZ
                );
            }
        }
    }

    /// Sets the regulator to exactly `vol_mv`. Succeeds without doing anything
    /// when no regulator is present.
    pub fn apply_voltage(&mut self, vol_mv: u32) -> Result<(), VoltageError> {
        let Some(regulator) = self.regulator.as_mut() else {
            return Ok(());
        };
        let uv = u64::from(vol_mv) * UV_PER_MV;
        regulator
            .set_voltage_uv(uv, uv)
            .map_err(|e| VoltageError::Set {
                requested_mv: vol_mv,
                reason: e.to_string(),
            })
    }

    pub fn current_voltage_mv(&self) -> Option<Result<u32, VoltageError>> {
        self.regulator.as_ref().map(|regulator| {
            let uv = regulator
                .voltage_uv()
                .map_err(|e| VoltageError::Read(e.to_string()))?;
            u32::try_from(uv / UV_PER_MV)
                .map_err(|_| VoltageError::Read(format!("{uv} uV is out of range")))
        })
    }

    pub fn enable_clocks(&mut self) -> Result<(), ClockError> {
        if self.clocks_enabled {
            return Ok(());
        }
        // already enabled domains stay enabled on failure
        for clock in &mut self.clocks {
            clock.prepare_enable().map_err(|e| ClockError::Enable {
                domain: clock.name().to_string(),
                reason: e.to_string(),
            })?;
        }
        self.clocks_enabled = true;
        Ok(())
    }

    pub fn disable_clocks(&mut self) -> Result<(), ClockError> {
        if !self.clocks_enabled {
            return Ok(());
        }
        for clock in self.clocks.iter_mut().rev() {
            clock.disable_unprepare();
        }
        self.clocks_enabled = false;
        Ok(())
    }

    /// Rate of the first domain; the others are assumed to follow it.
    pub fn current_frequency_mhz(&self) -> Result<u32, ClockError> {
        let clock = self.clocks.first().ok_or(ClockError::NoDomain)?;
        clock
            .rate_hz()
            .map_err(|e| e.to_string())
            .and_then(hz_to_mhz)
            .map_err(|reason| ClockError::ReadRate {
                domain: clock.name().to_string(),
                reason,
            })
    }

    pub fn pause_device(&mut self) {
        self.pipeline.pause();
    }

    pub fn resume_device(&mut self) {
        self.pipeline.resume();
    }
}
