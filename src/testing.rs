//! Recording hardware doubles shared by the unit tests.

use std::io::{Error as IoError, Result as IoResult};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::power_rail::{
    ApplyPolicy, ClockDomain, DevicePipeline, PowerRail, Regulator, TemperatureSensor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwEvent {
    Pause,
    Resume,
    SetRate(String, u32),
    SetVoltage(u64, u64),
    Enable(String),
    Disable(String),
}

impl HwEvent {
    pub fn set_rate(domain: &str, mhz: u32) -> Self {
        Self::SetRate(domain.to_string(), mhz)
    }
}

type EventLog = Arc<Mutex<Vec<HwEvent>>>;

#[derive(Default)]
struct ClockState {
    rate_hz: u64,
    fail_rate_mhz: Option<u32>,
    fail_enable: bool,
}

#[derive(Clone)]
pub struct ClockHandle(Arc<Mutex<ClockState>>);

impl ClockHandle {
    pub fn fail_rate(&self, mhz: u32) {
        self.0.lock().unwrap().fail_rate_mhz = Some(mhz);
    }

    pub fn fail_enable(&self) {
        self.0.lock().unwrap().fail_enable = true;
    }

    /// Overwrites the rate as if the hardware had moved on its own.
    pub fn set_raw_rate_hz(&self, hz: u64) {
        self.0.lock().unwrap().rate_hz = hz;
    }

    pub fn rate_mhz(&self) -> u32 {
        (self.0.lock().unwrap().rate_hz / 1_000_000) as u32
    }
}

struct FakeClock {
    name: String,
    state: Arc<Mutex<ClockState>>,
    log: EventLog,
    delay: Duration,
}

impl ClockDomain for FakeClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_rate_hz(&mut self, hz: u64) -> IoResult<()> {
        std::thread::sleep(self.delay);
        let mut state = self.state.lock().unwrap();
        let mhz = (hz / 1_000_000) as u32;
        if state.fail_rate_mhz == Some(mhz) {
            return Err(IoError::other("rate rejected"));
        }
        state.rate_hz = hz;
        self.log.lock().unwrap().push(HwEvent::SetRate(self.name.clone(), mhz));
        Ok(())
    }

    fn rate_hz(&self) -> IoResult<u64> {
        Ok(self.state.lock().unwrap().rate_hz)
    }

    fn prepare_enable(&mut self) -> IoResult<()> {
        if self.state.lock().unwrap().fail_enable {
            return Err(IoError::other("gate stuck"));
        }
        self.log.lock().unwrap().push(HwEvent::Enable(self.name.clone()));
        Ok(())
    }

    fn disable_unprepare(&mut self) {
        self.log.lock().unwrap().push(HwEvent::Disable(self.name.clone()));
    }
}

#[derive(Default)]
struct RegulatorState {
    uv: u64,
    fail: bool,
}

struct FakeRegulator {
    state: Arc<Mutex<RegulatorState>>,
    log: EventLog,
}

impl Regulator for FakeRegulator {
    fn set_voltage_uv(&mut self, min_uv: u64, max_uv: u64) -> IoResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(IoError::other("regulator refused"));
        }
        state.uv = max_uv;
        self.log.lock().unwrap().push(HwEvent::SetVoltage(min_uv, max_uv));
        Ok(())
    }

    fn voltage_uv(&self) -> IoResult<u64> {
        Ok(self.state.lock().unwrap().uv)
    }
}

struct FakePipeline {
    log: EventLog,
}

impl DevicePipeline for FakePipeline {
    fn pause(&mut self) {
        self.log.lock().unwrap().push(HwEvent::Pause);
    }

    fn resume(&mut self) {
        self.log.lock().unwrap().push(HwEvent::Resume);
    }
}

struct FakeSensor {
    temperature: Arc<AtomicI64>,
    broken: Arc<AtomicBool>,
}

impl TemperatureSensor for FakeSensor {
    fn id(&self) -> u32 {
        0
    }

    fn read_temperature(&self) -> IoResult<i64> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(IoError::other("sensor offline"));
        }
        Ok(self.temperature.load(Ordering::SeqCst))
    }
}

pub struct TestRig {
    log: EventLog,
    clocks: Vec<(String, ClockHandle)>,
    regulator: Option<Arc<Mutex<RegulatorState>>>,
    temperature: Arc<AtomicI64>,
    sensor_broken: Arc<AtomicBool>,
    delay: Duration,
}

impl TestRig {
    pub fn new(domains: &[&str]) -> Self {
        Self {
            log: EventLog::default(),
            clocks: domains
                .iter()
                .map(|name| (name.to_string(), ClockHandle(Arc::default())))
                .collect(),
            regulator: Some(Arc::default()),
            temperature: Arc::new(AtomicI64::new(40)),
            sensor_broken: Arc::new(AtomicBool::new(false)),
            delay: Duration::ZERO,
        }
    }

    pub fn without_regulator(mut self) -> Self {
        self.regulator = None;
        self
    }

    /// Slows every rate change down so that racing callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn clock(&self, name: &str) -> ClockHandle {
        self.clocks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, handle)| handle.clone())
            .unwrap()
    }

    pub fn fail_regulator(&self) {
        if let Some(state) = &self.regulator {
            state.lock().unwrap().fail = true;
        }
    }

    pub fn set_temperature(&self, temperature: i64) {
        self.temperature.store(temperature, Ordering::SeqCst);
    }

    pub fn break_sensor(&self) {
        self.sensor_broken.store(true, Ordering::SeqCst);
    }

    pub fn pipeline(&self) -> Box<dyn DevicePipeline> {
        Box::new(FakePipeline {
            log: self.log.clone(),
        })
    }

    pub fn sensor(&self) -> Box<dyn TemperatureSensor> {
        Box::new(FakeSensor {
            temperature: self.temperature.clone(),
            broken: self.sensor_broken.clone(),
        })
    }

    pub fn rail(&self, policy: ApplyPolicy) -> PowerRail {
        let clocks = self
            .clocks
            .iter()
            .map(|(name, handle)| {
                Box::new(FakeClock {
                    name: name.clone(),
                    state: handle.0.clone(),
                    log: self.log.clone(),
                    delay: self.delay,
                }) as Box<dyn ClockDomain>
            })
            .collect();
        let regulator = self.regulator.as_ref().map(|state| {
            Box::new(FakeRegulator {
                state: state.clone(),
                log: self.log.clone(),
            }) as Box<dyn Regulator>
        });
        PowerRail::new(clocks, regulator, self.pipeline(), policy).unwrap()
    }

    pub fn events(&self) -> Vec<HwEvent> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Number of rate changes seen so far, rollbacks included.
    pub fn rate_changes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, HwEvent::SetRate(..)))
            .count()
    }
}
