use serde::Serialize;

use crate::constants::THERMAL_TABLE_CAPACITY;
use crate::error::ConfigError;

/// One row of the throttling table: at or above `temp_threshold`, the gpu is
/// capped to `capped_freq_mhz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThermalEntry {
    pub temp_threshold: i64,
    pub capped_freq_mhz: u32,
}

impl ThermalEntry {
    pub fn new(temp_threshold: i64, capped_freq_mhz: u32) -> Self {
        Self {
            temp_threshold,
            capped_freq_mhz,
        }
    }
}

/// Fixed-capacity table sorted by descending threshold.
#[derive(Debug, Clone, Default)]
pub struct ThermalTable {
    entries: [Option<ThermalEntry>; THERMAL_TABLE_CAPACITY],
    count: usize,
}

impl ThermalTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the table from configuration rows.
    ///
    /// Fails when there are more rows than the backing storage can hold or
    /// when a row caps the gpu to 0 MHz; the caller is expected to carry on
    /// without throttling.
    pub fn from_entries(mut rows: Vec<ThermalEntry>) -> Result<Self, ConfigError> {
        if rows.len() > THERMAL_TABLE_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "has {} rows, at most {THERMAL_TABLE_CAPACITY} are supported",
                rows.len()
            )));
        }
        if let Some(row) = rows.iter().find(|row| row.capped_freq_mhz == 0) {
            return Err(ConfigError::Invalid(format!(
                "caps the gpu to 0 MHz at {}",
                row.temp_threshold
            )));
        }
        if !rows.is_sorted_by(|a, b| a.temp_threshold >= b.temp_threshold) {
            tracing::warn!("thermal table rows are not in descending order, sorting them");
            rows.sort_by(|a, b| b.temp_threshold.cmp(&a.temp_threshold));
        }

        let mut table = Self::default();
        for (slot, row) in table.entries.iter_mut().zip(rows) {
            *slot = Some(row);
            table.count += 1;
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn rows(&self) -> impl Iterator<Item = &ThermalEntry> {
        self.entries[..self.count].iter().flatten()
    }

    /// Cap for `temperature`: the first band (from the hottest down) whose
    /// threshold has been reached. `None` means no throttling.
    pub fn lookup(&self, temperature: i64) -> Option<u32> {
        self.rows()
            .find(|entry| entry.temp_threshold <= temperature)
            .map(|entry| entry.capped_freq_mhz)
    }
}
