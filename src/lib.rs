// Public modules
pub mod config;
pub mod control;
pub mod error;
pub mod governor;
pub mod power_rail;
pub mod sysfs;
pub mod thermal_table;

#[cfg(test)]
mod testing;

// Re-export constants commonly used
pub mod constants {
    pub const DEFAULT_NORMAL_FREQ_MHZ: u32 = 384;
    pub const DEFAULT_EXTREME_FREQ_MHZ: u32 = 576;
    pub const DEFAULT_SUSPEND_FREQ_MHZ: u32 = 144;

    /// Platform safety ceiling for the gpu supply
    pub const MAX_VOLTAGE_MV: u32 = 1300;

    pub const THERMAL_TABLE_CAPACITY: usize = 8;
    pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;
}

pub use governor::{Governor, ThermalInput, Transition};
