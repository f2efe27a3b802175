use std::fs::{self, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use crate::config::{ClockConfig, Config, RegulatorConfig, SensorConfig};
use crate::error::ConfigError;
use crate::power_rail::{ClockDomain, DevicePipeline, PowerRail, Regulator, TemperatureSensor};

fn read_value<T: std::str::FromStr>(path: &Path) -> IoResult<T> {
    let content = fs::read_to_string(path)?;
    content.trim().parse().map_err(|_| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("{} does not hold a number: {:?}", path.display(), content.trim()),
        )
    })
}

/// Writes in one go, the way sysfs attributes expect it
fn write_value(path: &Path, value: impl std::fmt::Display) -> IoResult<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(format!("{value}\n").as_bytes())?;
    file.flush()
}

/// Clock whose rate lives in a file, in Hz
pub struct SysfsClock {
    name: String,
    rate_path: PathBuf,
    enable_path: Option<PathBuf>,
}

impl SysfsClock {
    pub fn open(config: &ClockConfig) -> Result<Self, ConfigError> {
        if !config.rate_path.exists() {
            return Err(ConfigError::MissingClock(config.name.clone()));
        }
        Ok(Self {
            name: config.name.clone(),
            rate_path: config.rate_path.clone(),
            enable_path: config.enable_path.clone(),
        })
    }
}

impl ClockDomain for SysfsClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_rate_hz(&mut self, hz: u64) -> IoResult<()> {
        write_value(&self.rate_path, hz)
    }

    fn rate_hz(&self) -> IoResult<u64> {
        read_value(&self.rate_path)
    }

    fn prepare_enable(&mut self) -> IoResult<()> {
        match &self.enable_path {
            Some(path) => write_value(path, 1),
            None => Ok(()),
        }
    }

    fn disable_unprepare(&mut self) {
        if let Some(path) = &self.enable_path {
            if let Err(e) = write_value(path, 0) {
                tracing::error!("failed to disable {} clock: {e}", self.name);
            }
        }
    }
}

/// Regulator driven through a microvolt file. Only one value can be written,
/// so a range collapses to its upper bound.
pub struct SysfsRegulator {
    path: PathBuf,
}

impl SysfsRegulator {
    /// `None` when the supply isn't there; voltage control is then off.
    pub fn open(config: &RegulatorConfig) -> Option<Self> {
        if !config.path.exists() {
            tracing::error!("failed to get regulator {}", config.id);
            return None;
        }
        Some(Self {
            path: config.path.clone(),
        })
    }
}

impl Regulator for SysfsRegulator {
    fn set_voltage_uv(&mut self, min_uv: u64, max_uv: u64) -> IoResult<()> {
        if min_uv > max_uv {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("empty voltage range {min_uv}..{max_uv} uV"),
            ));
        }
        write_value(&self.path, max_uv)
    }

    fn voltage_uv(&self) -> IoResult<u64> {
        read_value(&self.path)
    }
}

pub struct SysfsSensor {
    id: u32,
    path: PathBuf,
    divisor: i64,
}

impl SysfsSensor {
    pub fn open(config: &SensorConfig) -> Option<Self> {
        if !config.path.exists() {
            tracing::error!(
                "temperature sensor {} not found at {}",
                config.id,
                config.path.display()
            );
            return None;
        }
        Some(Self {
            id: config.id,
            path: config.path.clone(),
            divisor: config.divisor,
        })
    }
}

impl TemperatureSensor for SysfsSensor {
    fn id(&self) -> u32 {
        self.id
    }

    fn read_temperature(&self) -> IoResult<i64> {
        read_value::<i64>(&self.path).map(|raw| raw / self.divisor)
    }
}

/// Tells the gpu pipeline to hold off while the operating point moves.
/// Without a control file there is nothing to pause.
pub struct FilePipeline {
    path: Option<PathBuf>,
}

impl FilePipeline {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn send(&self, command: &str) {
        if let Some(path) = &self.path {
            if let Err(e) = write_value(path, command) {
                tracing::error!("failed to {command} the gpu pipeline: {e}");
            }
        }
    }
}

impl DevicePipeline for FilePipeline {
    fn pause(&mut self) {
        self.send("pause");
    }

    fn resume(&mut self) {
        self.send("resume");
    }
}

/// Acquires every handle the configuration names. A missing clock is fatal,
/// a missing regulator or sensor is not.
pub fn open(config: &Config) -> Result<(PowerRail, Option<Box<dyn TemperatureSensor>>), ConfigError> {
    let clocks = config
        .clocks
        .iter()
        .map(|c| SysfsClock::open(c).map(|clock| Box::new(clock) as Box<dyn ClockDomain>))
        .collect::<Result<Vec<_>, _>>()?;
    let regulator = config
        .regulator
        .as_ref()
        .and_then(SysfsRegulator::open)
        .map(|r| Box::new(r) as Box<dyn Regulator>);
    let pipeline = Box::new(FilePipeline::new(config.pipeline_path.clone()));
    let rail = PowerRail::new(clocks, regulator, pipeline, config.policy)?;

    let sensor = config
        .sensor
        .as_ref()
        .and_then(SysfsSensor::open)
        .map(|s| Box::new(s) as Box<dyn TemperatureSensor>);
    if sensor.is_none() && config.capabilities.thermal_table && !config.table.is_empty() {
        tracing::warn!("thermal table configured but no temperature sensor, throttling is off");
    }

    Ok((rail, sensor))
}
