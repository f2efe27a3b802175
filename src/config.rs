use std::path::{Path, PathBuf};
use std::time::Duration;

use toml::{Table, Value};

use crate::constants::*;
use crate::error::ConfigError;
use crate::governor::{Capabilities, ControlFlags, GovernorSettings, Limits};
use crate::power_rail::ApplyPolicy;
use crate::thermal_table::{ThermalEntry, ThermalTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockConfig {
    pub name: String,
    /// File holding the rate in Hz
    pub rate_path: PathBuf,
    /// File taking `1`/`0` to gate the clock, if the platform exposes one
    pub enable_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegulatorConfig {
    pub id: String,
    /// File holding the voltage in µV
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub id: u32,
    pub path: PathBuf,
    /// Raw readings are divided by this (1000 for millidegrees)
    pub divisor: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub limits: Limits,
    pub flags: ControlFlags,
    pub table: ThermalTable,
    pub capabilities: Capabilities,
    pub policy: ApplyPolicy,
    pub sample_interval: Duration,
    pub clocks: Vec<ClockConfig>,
    pub regulator: Option<RegulatorConfig>,
    pub sensor: Option<SensorConfig>,
    /// File receiving `pause`/`resume` around operating point changes
    pub pipeline_path: Option<PathBuf>,
}

fn positive_u32(v: &Value) -> Result<u32, &'static str> {
    v.as_integer()
        .ok_or("must be an integer")
        .and_then(|v| v.is_positive().then_some(v).ok_or("must be positive"))
        .and_then(|v| u32::try_from(v).map_err(|_| "cannot be greater than 4294967295"))
}

/// `0`/`1` like the fex script, or a toml boolean.
fn switch(v: &Value) -> Result<bool, &'static str> {
    match v {
        Value::Boolean(b) => Ok(*b),
        Value::Integer(0) => Ok(false),
        Value::Integer(1) => Ok(true),
        Value::Integer(_) => Err("must be 0 or 1"),
        _ => Err("must be a boolean or 0/1"),
    }
}

fn path(v: &Value) -> Result<PathBuf, &'static str> {
    v.as_str().map(PathBuf::from).ok_or("must be a string")
}

impl Config {
    /// `$XDG_CONFIG_HOME/sunxi-gpu-governor/config.toml`, `/etc` when there is
    /// no config dir.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("/etc"));
        path.push("sunxi-gpu-governor");
        path.push("config.toml");
        path
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config = text.parse::<Table>()?;

        let frequency = config.get("frequency").and_then(|t| t.as_table());
        // MHz
        let normal = frequency
            .and_then(|t| t.get("normal"))
            .ok_or("is missing")
            .and_then(positive_u32)
            .unwrap_or_else(|s| {
                tracing::info!(
                    "frequency.normal {s}, replaced with the default of {DEFAULT_NORMAL_FREQ_MHZ} MHz"
                );
                DEFAULT_NORMAL_FREQ_MHZ
            });
        // MHz
        let extreme = frequency
            .and_then(|t| t.get("extreme"))
            .ok_or("is missing")
            .and_then(positive_u32)
            .unwrap_or_else(|s| {
                tracing::info!(
                    "frequency.extreme {s}, replaced with the default of {DEFAULT_EXTREME_FREQ_MHZ} MHz"
                );
                DEFAULT_EXTREME_FREQ_MHZ
            });
        // MHz
        let suspend = frequency
            .and_then(|t| t.get("suspend"))
            .ok_or("is missing")
            .and_then(positive_u32)
            .unwrap_or_else(|s| {
                tracing::info!(
                    "frequency.suspend {s}, replaced with the default of {DEFAULT_SUSPEND_FREQ_MHZ} MHz"
                );
                DEFAULT_SUSPEND_FREQ_MHZ
            });
        if normal > extreme {
            tracing::warn!("frequency.normal ({normal} MHz) is above frequency.extreme ({extreme} MHz)");
        }

        let control = config.get("control").and_then(|t| t.as_table());
        let scene_ctrl_enabled = control
            .and_then(|t| t.get("scene-ctrl"))
            .ok_or("is missing")
            .and_then(switch)
            .unwrap_or_else(|s| {
                tracing::info!("control.scene-ctrl {s}, replaced with the default of 1");
                true
            });
        let temp_ctrl_enabled = control
            .and_then(|t| t.get("temp-ctrl"))
            .ok_or("is missing")
            .and_then(switch)
            .unwrap_or_else(|s| {
                tracing::info!("control.temp-ctrl {s}, replaced with the default of 1");
                true
            });
        let policy = control
            .and_then(|t| t.get("apply-policy"))
            .map(|v| match v.as_str() {
                Some("rollback") => Ok(ApplyPolicy::Rollback),
                Some("best-effort") => Ok(ApplyPolicy::BestEffort),
                _ => Err("must be \"rollback\" or \"best-effort\""),
            })
            .unwrap_or(Ok(ApplyPolicy::default()))
            .unwrap_or_else(|s| {
                tracing::warn!("control.apply-policy {s}, replaced with \"rollback\"");
                ApplyPolicy::default()
            });

        let capabilities = config.get("capabilities").and_then(|t| t.as_table());
        let capability = |key: &str| {
            capabilities
                .and_then(|t| t.get(key))
                .map(switch)
                .unwrap_or(Ok(true))
                .unwrap_or_else(|s| {
                    tracing::warn!("capabilities.{key} {s}, left enabled");
                    true
                })
        };
        let capabilities = Capabilities {
            thermal_table: capability("thermal-table"),
            external_cooling: capability("external-cooling"),
            early_suspend: capability("early-suspend"),
        };

        let thermal = config.get("thermal").and_then(|t| t.as_table());
        // ms
        let sample_interval = thermal
            .and_then(|t| t.get("sample-interval"))
            .ok_or("is missing")
            .and_then(|v| v.as_integer().ok_or("must be an integer"))
            .and_then(|v| v.is_positive().then_some(v).ok_or("must be positive"))
            .map(|v| v as u64)
            .unwrap_or_else(|s| {
                tracing::info!(
                    "thermal.sample-interval {s}, replaced with the default of \
                    {DEFAULT_SAMPLE_INTERVAL_MS} ms"
                );
                DEFAULT_SAMPLE_INTERVAL_MS
            });
        let table = match thermal.and_then(|t| t.get("table")) {
            Some(rows) if capabilities.thermal_table => Self::parse_table(rows),
            Some(_) => {
                tracing::info!("thermal.table present but the thermal-table capability is off");
                ThermalTable::empty()
            }
            None => ThermalTable::empty(),
        };
        let sensor = match thermal.and_then(|t| t.get("sensor-path")) {
            Some(v) => {
                let path = path(v)
                    .map_err(|s| ConfigError::Invalid(format!("thermal.sensor-path {s}")))?;
                let id = thermal
                    .and_then(|t| t.get("sensor"))
                    .ok_or("is missing")
                    .and_then(|v| v.as_integer().ok_or("must be an integer"))
                    .and_then(|v| u32::try_from(v).map_err(|_| "must not be negative"))
                    .unwrap_or_else(|s| {
                        tracing::info!("thermal.sensor {s}, replaced with the default of 0");
                        0
                    });
                let divisor = thermal
                    .and_then(|t| t.get("divisor"))
                    .ok_or("is missing")
                    .and_then(|v| v.as_integer().ok_or("must be an integer"))
                    .and_then(|v| v.is_positive().then_some(v).ok_or("must be positive"))
                    .unwrap_or(1000);
                Some(SensorConfig { id, path, divisor })
            }
            None => None,
        };

        let clocks = Self::parse_clocks(config.get("clocks"))?;

        let regulator = match config.get("regulator").and_then(|t| t.as_table()) {
            Some(t) => {
                let path = t
                    .get("path")
                    .ok_or("is missing")
                    .and_then(path)
                    .map_err(|s| ConfigError::Invalid(format!("regulator.path {s}")))?;
                let id = t
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("vdd-gpu")
                    .to_string();
                Some(RegulatorConfig { id, path })
            }
            None => None,
        };

        let pipeline_path = config
            .get("device")
            .and_then(|t| t.as_table())
            .and_then(|t| t.get("pipeline"))
            .map(path)
            .transpose()
            .map_err(|s| ConfigError::Invalid(format!("device.pipeline {s}")))?;

        Ok(Self {
            limits: Limits::new(normal, extreme, suspend),
            flags: ControlFlags {
                temp_ctrl_enabled,
                scene_ctrl_enabled,
            },
            table,
            capabilities,
            policy,
            sample_interval: Duration::from_millis(sample_interval),
            clocks,
            regulator,
            sensor,
            pipeline_path,
        })
    }

    /// Bad tables only disable throttling, they never stop startup.
    fn parse_table(rows: &Value) -> ThermalTable {
        let Some(array) = rows.as_array() else {
            tracing::warn!("thermal.table must be an array, ignored");
            return ThermalTable::empty();
        };
        if array.len() > THERMAL_TABLE_CAPACITY {
            tracing::warn!(
                "thermal.table has {} rows, at most {THERMAL_TABLE_CAPACITY} are supported, ignored",
                array.len()
            );
            return ThermalTable::empty();
        }

        let mut entries = Vec::with_capacity(array.len());
        for (i, row) in array.iter().enumerate() {
            let Some(row) = row.as_table() else {
                tracing::warn!("thermal.table[{i}] must be a table, skipped");
                continue;
            };
            let temperature = row
                .get("temperature")
                .ok_or("is missing")
                .and_then(|v| v.as_integer().ok_or("must be an integer"));
            let frequency = row
                .get("frequency")
                .ok_or("is missing")
                .and_then(positive_u32);
            match (temperature, frequency) {
                (Ok(temperature), Ok(frequency)) => {
                    entries.push(ThermalEntry::new(temperature, frequency))
                }
                (Err(s), _) => tracing::warn!("thermal.table[{i}].temperature {s}, skipped"),
                (_, Err(s)) => tracing::warn!("thermal.table[{i}].frequency {s}, skipped"),
            }
        }
        ThermalTable::from_entries(entries).unwrap_or_else(|e| {
            tracing::warn!("thermal.table {e}, ignored");
            ThermalTable::empty()
        })
    }

    fn parse_clocks(clocks: Option<&Value>) -> Result<Vec<ClockConfig>, ConfigError> {
        let array = clocks
            .ok_or_else(|| ConfigError::Invalid("clocks must exist".to_string()))?
            .as_array()
            .ok_or_else(|| ConfigError::Invalid("clocks must be an array".to_string()))?;
        if array.is_empty() {
            return Err(ConfigError::Invalid("clocks must not be empty".to_string()));
        }

        let mut out: Vec<ClockConfig> = Vec::with_capacity(array.len());
        for (i, t) in array.iter().enumerate() {
            let t = t
                .as_table()
                .ok_or_else(|| ConfigError::Invalid(format!("clocks[{i}] must be a table")))?;
            let name = t
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ConfigError::Invalid(format!("clocks[{i}].name must be a string")))?
                .to_string();
            let rate_path = t
                .get("rate")
                .ok_or("is missing")
                .and_then(path)
                .map_err(|_| ConfigError::MissingClock(name.clone()))?;
            let enable_path = t
                .get("enable")
                .map(path)
                .transpose()
                .map_err(|s| ConfigError::Invalid(format!("clocks[{i}].enable {s}")))?;
            if out.iter().any(|c| c.name == name) {
                return Err(ConfigError::Invalid(format!("clock {name} defined twice")));
            }
            out.push(ClockConfig {
                name,
                rate_path,
                enable_path,
            });
        }
        Ok(out)
    }

    pub fn settings(&self) -> GovernorSettings {
        GovernorSettings {
            limits: self.limits,
            flags: self.flags,
            table: self.table.clone(),
            capabilities: self.capabilities,
        }
    }
}
