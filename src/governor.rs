use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::constants::MAX_VOLTAGE_MV;
use crate::error::{ConfigError, ControlError, GovernorError};
use crate::power_rail::{PowerRail, TemperatureSensor};
use crate::thermal_table::{ThermalEntry, ThermalTable};

/// Live operating point of the gpu
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperatingPoint {
    pub current_freq_mhz: u32,
    /// 0 when unknown or when there is no regulator
    pub current_voltage_mv: u32,
    pub clocks_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Limits {
    pub normal_freq_mhz: u32,
    pub extreme_freq_mhz: u32,
    pub suspend_freq_mhz: u32,
    /// Ceiling set by the thermal paths
    pub max_freq_mhz: u32,
}

impl Limits {
    pub fn new(normal_freq_mhz: u32, extreme_freq_mhz: u32, suspend_freq_mhz: u32) -> Self {
        Self {
            normal_freq_mhz,
            extreme_freq_mhz,
            suspend_freq_mhz,
            max_freq_mhz: extreme_freq_mhz,
        }
    }

    /// Every configured frequency must be above 0 MHz.
    pub fn validate(&self) -> Result<(), ConfigError> {
        [
            ("normal", self.normal_freq_mhz),
            ("extreme", self.extreme_freq_mhz),
            ("suspend", self.suspend_freq_mhz),
        ]
        .into_iter()
        .find(|(_, mhz)| *mhz == 0)
        .map_or(Ok(()), |(name, _)| {
            Err(ConfigError::Invalid(format!(
                "{name} frequency must be above 0 MHz"
            )))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlFlags {
    pub temp_ctrl_enabled: bool,
    pub scene_ctrl_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    Thermal,
    Scene,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneCommand {
    Normal,  // 0
    Extreme, // 1
}

impl TryFrom<u64> for SceneCommand {
    type Error = ControlError;

    fn try_from(cmd: u64) -> Result<Self, Self::Error> {
        match cmd {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Extreme),
            value => Err(ControlError::TooLarge { value, max: 1 }),
        }
    }
}

/// Input of a thermal evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalInput {
    /// A sensor sample, resolved through the throttling table.
    Temperature(i64),
    /// A cap pushed by an external cooling governor. `None` or a
    /// non-positive value lifts the cap.
    ExternalCap(Option<i64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SceneControlDisabled,
    ThermalControlDisabled,
    /// The platform capability behind the request is off
    Unsupported,
    /// The thermal ceiling is at or below the requested scene frequency
    CappedByThermal,
}

/// Result of a frequency request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from_mhz: u32, to_mhz: u32 },
    Unchanged,
    Dropped(DropReason),
}

/// Platform features resolved once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Periodic sampling through the throttling table, shown by `tempctrl`
    pub thermal_table: bool,
    /// Caps pushed by an external cooling governor
    pub external_cooling: bool,
    /// Suspend/resume lowers and restores the frequency
    pub early_suspend: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            thermal_table: true,
            external_cooling: true,
            early_suspend: true,
        }
    }
}

pub struct GovernorSettings {
    pub limits: Limits,
    pub flags: ControlFlags,
    pub table: ThermalTable,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub operating_point: OperatingPoint,
    pub limits: Limits,
    pub flags: ControlFlags,
    pub capabilities: Capabilities,
    pub sensor: Option<u32>,
    pub temperature: Option<i64>,
    pub table: Vec<ThermalEntry>,
}

/// Everything the lock guards
struct GovernorState {
    rail: PowerRail,
    op: OperatingPoint,
    limits: Limits,
    flags: ControlFlags,
}

impl GovernorState {
    /// Hardware frequency, or the last applied one when the clock can't be read.
    fn current_freq(&self) -> u32 {
        self.rail.current_frequency_mhz().unwrap_or_else(|e| {
            tracing::warn!("{e}, assuming {} MHz", self.op.current_freq_mhz);
            self.op.current_freq_mhz
        })
    }

    /// Moves the clocks to `target`, bracketed by pause/resume. Does nothing
    /// when already there.
    fn transition(&mut self, target: u32) -> Result<Transition, GovernorError> {
        if target == 0 {
            return Err(ControlError::InvalidInput {
                input: target.to_string(),
            }
            .into());
        }
        let from = self.current_freq();
        if from == target {
            return Ok(Transition::Unchanged);
        }

        self.rail.pause_device();
        let result = self.rail.apply_frequency(target);
        self.rail.resume_device();

        match result {
            Ok(()) => {
                self.op.current_freq_mhz = target;
                tracing::info!("[FREQ] {from} MHz → {target} MHz");
                Ok(Transition::Applied {
                    from_mhz: from,
                    to_mhz: target,
                })
            }
            Err(e) => {
                // whatever the rail left behind is the new truth
                self.op.current_freq_mhz = self.current_freq();
                Err(e.into())
            }
        }
    }
}

/// Frequency/voltage governor. Every hardware change and every update of
/// the operating point, limits and flags goes through one mutex.
pub struct Governor {
    state: Mutex<GovernorState>,
    table: ThermalTable,
    sensor: Option<Box<dyn TemperatureSensor>>,
    capabilities: Capabilities,
}

impl Governor {
    /// Brings the clocks up at the normal frequency.
    pub fn new(
        settings: GovernorSettings,
        mut rail: PowerRail,
        sensor: Option<Box<dyn TemperatureSensor>>,
    ) -> Result<Self, GovernorError> {
        let GovernorSettings {
            limits,
            flags,
            table,
            capabilities,
        } = settings;
        limits.validate()?;
        let limits = Limits {
            max_freq_mhz: limits.extreme_freq_mhz,
            ..limits
        };

        // nothing consumes the clocks yet, no pause needed
        rail.apply_frequency(limits.normal_freq_mhz)
            .map_err(GovernorError::Init)?;
        rail.enable_clocks().map_err(GovernorError::Init)?;

        let current_voltage_mv = match rail.current_voltage_mv() {
            Some(Ok(mv)) => mv,
            Some(Err(e)) => {
                tracing::warn!("{e}");
                0
            }
            None => 0,
        };
        let op = OperatingPoint {
            current_freq_mhz: limits.normal_freq_mhz,
            current_voltage_mv,
            clocks_enabled: rail.clocks_enabled(),
        };

        tracing::info!("init gpu clocks successfully");
        tracing::info!("voltage             : {current_voltage_mv} mV");
        tracing::info!("initial frequency   : {} MHz", op.current_freq_mhz);
        tracing::info!(
            "frequencies         : normal {} / extreme {} / suspend {} MHz",
            limits.normal_freq_mhz,
            limits.extreme_freq_mhz,
            limits.suspend_freq_mhz
        );
        tracing::info!(
            "control             : thermal {} / scene {}, {} table rows",
            flags.temp_ctrl_enabled,
            flags.scene_ctrl_enabled,
            table.len()
        );
        tracing::info!("apply policy        : {:?}", rail.policy());

        Ok(Self {
            state: Mutex::new(GovernorState {
                rail,
                op,
                limits,
                flags,
            }),
            table,
            sensor,
            capabilities,
        })
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("governor lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn table(&self) -> &ThermalTable {
        &self.table
    }

    pub fn sensor_id(&self) -> Option<u32> {
        self.sensor.as_ref().map(|s| s.id())
    }

    /// Unconditional frequency change, not bounded by the thermal ceiling.
    pub fn manual_set(&self, freq_mhz: u32) -> Result<Transition, GovernorError> {
        let mut state = self.lock();
        if state.flags.temp_ctrl_enabled && freq_mhz > state.limits.max_freq_mhz {
            tracing::warn!(
                "manual frequency {freq_mhz} MHz is above the thermal ceiling of {} MHz",
                state.limits.max_freq_mhz
            );
        }
        state.transition(freq_mhz)
    }

    pub fn scene_set(&self, cmd: SceneCommand) -> Result<Transition, GovernorError> {
        let mut state = self.lock();
        if !state.flags.scene_ctrl_enabled {
            return Ok(Transition::Dropped(DropReason::SceneControlDisabled));
        }
        let target = match cmd {
            SceneCommand::Normal => state.limits.normal_freq_mhz,
            SceneCommand::Extreme => state.limits.extreme_freq_mhz,
        };
        if state.flags.temp_ctrl_enabled && target >= state.limits.max_freq_mhz {
            return Ok(Transition::Dropped(DropReason::CappedByThermal));
        }
        state.transition(target)
    }

    pub fn thermal_update(&self, input: ThermalInput) -> Result<Transition, GovernorError> {
        if matches!(input, ThermalInput::ExternalCap(_)) && !self.capabilities.external_cooling {
            return Ok(Transition::Dropped(DropReason::Unsupported));
        }
        let mut state = self.lock();
        match input {
            ThermalInput::Temperature(temperature) => {
                if !state.flags.temp_ctrl_enabled {
                    return Ok(Transition::Dropped(DropReason::ThermalControlDisabled));
                }
                match self.table.lookup(temperature) {
                    Some(cap) => {
                        state.limits.max_freq_mhz = cap;
                        state.transition(cap)
                    }
                    None => {
                        state.limits.max_freq_mhz = state.limits.extreme_freq_mhz;
                        Ok(Transition::Unchanged)
                    }
                }
            }
            ThermalInput::ExternalCap(Some(freq)) if freq > 0 && state.flags.temp_ctrl_enabled => {
                let cap = u32::try_from(freq).unwrap_or(u32::MAX);
                let result = state.transition(cap);
                state.limits.max_freq_mhz = cap;
                result
            }
            ThermalInput::ExternalCap(_) => {
                let normal = state.limits.normal_freq_mhz;
                let result = state.transition(normal);
                state.limits.max_freq_mhz = state.limits.extreme_freq_mhz;
                result
            }
        }
    }

    /// Reads the sensor and runs a table evaluation.
    pub fn sample_thermal(&self) -> Result<Transition, GovernorError> {
        let temperature = self.temperature()?;
        self.thermal_update(ThermalInput::Temperature(temperature))
    }

    /// Current sensor reading, taken outside the lock.
    pub fn temperature(&self) -> Result<i64, GovernorError> {
        let sensor = self.sensor.as_ref().ok_or(GovernorError::NoSensor)?;
        sensor
            .read_temperature()
            .map_err(|source| GovernorError::Sensor {
                sensor: sensor.id(),
                source,
            })
    }

    pub fn set_voltage(&self, vol_mv: u32) -> Result<(), GovernorError> {
        if vol_mv > MAX_VOLTAGE_MV {
            return Err(ControlError::TooLarge {
                value: u64::from(vol_mv),
                max: u64::from(MAX_VOLTAGE_MV),
            }
            .into());
        }
        let mut state = self.lock();
        state.rail.pause_device();
        let result = state.rail.apply_voltage(vol_mv);
        state.rail.resume_device();
        result?;
        if state.rail.has_regulator() {
            state.op.current_voltage_mv = vol_mv;
            tracing::info!("[VOLT] gpu voltage set to {vol_mv} mV");
        }
        Ok(())
    }

    /// Stores a control flag. Never changes the frequency by itself.
    pub fn set_flag(&self, flag: ControlFlag, value: u64) -> Result<(), ControlError> {
        let enabled = match value {
            0 => false,
            1 => true,
            value => return Err(ControlError::TooLarge { value, max: 1 }),
        };
        let mut state = self.lock();
        match flag {
            ControlFlag::Thermal => state.flags.temp_ctrl_enabled = enabled,
            ControlFlag::Scene => state.flags.scene_ctrl_enabled = enabled,
        }
        tracing::info!("{flag:?} control {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn flags(&self) -> ControlFlags {
        self.lock().flags
    }

    pub fn limits(&self) -> Limits {
        self.lock().limits
    }

    pub fn current_frequency_mhz(&self) -> u32 {
        self.lock().current_freq()
    }

    /// Regulator read-back; `None` without a regulator.
    pub fn voltage_mv(&self) -> Option<u32> {
        let state = self.lock();
        state.rail.current_voltage_mv().map(|read| {
            read.unwrap_or_else(|e| {
                tracing::warn!("{e}");
                state.op.current_voltage_mv
            })
        })
    }

    pub fn suspend(&self) -> Result<Transition, GovernorError> {
        if !self.capabilities.early_suspend {
            return Ok(Transition::Dropped(DropReason::Unsupported));
        }
        tracing::info!("early suspend");
        let freq = self.lock().limits.suspend_freq_mhz;
        self.manual_set(freq)
    }

    pub fn resume(&self) -> Result<Transition, GovernorError> {
        if !self.capabilities.early_suspend {
            return Ok(Transition::Dropped(DropReason::Unsupported));
        }
        tracing::info!("late resume");
        let freq = self.lock().limits.normal_freq_mhz;
        self.manual_set(freq)
    }

    /// Gates the clocks; the last frequency is kept for the next enable.
    pub fn shutdown(&self) -> Result<(), GovernorError> {
        let mut state = self.lock();
        state.rail.disable_clocks()?;
        state.op.clocks_enabled = state.rail.clocks_enabled();
        Ok(())
    }

    pub fn status(&self) -> GovernorStatus {
        let temperature = self.temperature().ok();
        let state = self.lock();
        GovernorStatus {
            operating_point: OperatingPoint {
                current_freq_mhz: state.current_freq(),
                ..state.op
            },
            limits: state.limits,
            flags: state.flags,
            capabilities: self.capabilities,
            sensor: self.sensor_id(),
            temperature,
            table: self.table.rows().copied().collect(),
        }
    }
}
