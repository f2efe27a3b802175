use thiserror::Error;

/// Failure of a clock domain operation
#[derive(Error, Debug)]
pub enum ClockError {
    #[error("failed to set {domain} clock to {requested_mhz} MHz (currently {current_mhz} MHz): {reason}")]
    SetRate {
        domain: String,
        requested_mhz: u32,
        current_mhz: u32,
        reason: String,
    },
    #[error("failed to read {domain} clock rate: {reason}")]
    ReadRate { domain: String, reason: String },
    #[error("failed to enable {domain} clock: {reason}")]
    Enable { domain: String, reason: String },
    #[error("no clock domain configured")]
    NoDomain,
}

/// Failure of the supply regulator
#[derive(Error, Debug)]
pub enum VoltageError {
    #[error("failed to set gpu voltage to {requested_mv} mV: {reason}")]
    Set { requested_mv: u32, reason: String },
    #[error("failed to read gpu voltage: {0}")]
    Read(String),
}

/// Rejected control input, never fatal
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("invalid parameter {input:?}")]
    InvalidInput { input: String },
    #[error("the parameter is too large: {value} (max {max})")]
    TooLarge { value: u64, max: u64 },
    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(String),
}

/// Configuration problems detected while loading or at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    File(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("failed to get gpu {0} clock")]
    MissingClock(String),
}

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Voltage(#[from] VoltageError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to init gpu clocks: {0}")]
    Init(#[source] ClockError),
    #[error("failed to get the temperature from sensor {sensor}: {source}")]
    Sensor {
        sensor: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("no temperature sensor configured")]
    NoSensor,
}
