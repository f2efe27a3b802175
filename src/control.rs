use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use crate::constants::MAX_VOLTAGE_MV;
use crate::error::{ControlError, GovernorError};
use crate::governor::{ControlFlag, Governor, SceneCommand, Transition};

/// The text endpoints exposed under `dvfs/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Manual,
    Android,
    TempCtrl,
    SceneCtrl,
    Voltage,
}

impl Endpoint {
    pub const ALL: [Endpoint; 5] = [
        Endpoint::Manual,
        Endpoint::Android,
        Endpoint::TempCtrl,
        Endpoint::SceneCtrl,
        Endpoint::Voltage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Manual => "manual",
            Endpoint::Android => "android",
            Endpoint::TempCtrl => "tempctrl",
            Endpoint::SceneCtrl => "scenectrl",
            Endpoint::Voltage => "voltage",
        }
    }
}

impl FromStr for Endpoint {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| ControlError::UnknownEndpoint(s.to_string()))
    }
}

/// Base 10 unsigned integer, optionally followed by a single newline.
pub fn parse_ulong(input: &str) -> Result<u64, ControlError> {
    let digits = input.strip_suffix('\n').unwrap_or(input);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ControlError::InvalidInput {
            input: input.to_string(),
        });
    }
    digits.parse().map_err(|_| ControlError::InvalidInput {
        input: input.to_string(),
    })
}

fn parse_bounded(input: &str, max: u64) -> Result<u64, ControlError> {
    let value = parse_ulong(input)?;
    if value > max {
        return Err(ControlError::TooLarge { value, max });
    }
    Ok(value)
}

/// Text front end of the governor. Rejected writes leave every piece of
/// state untouched.
#[derive(Clone)]
pub struct ControlSurface {
    governor: Arc<Governor>,
}

impl ControlSurface {
    pub fn new(governor: Arc<Governor>) -> Self {
        Self { governor }
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    pub fn write(&self, endpoint: Endpoint, input: &str) -> Result<Option<Transition>, GovernorError> {
        let result = self.dispatch(endpoint, input);
        if let Err(e) = &result {
            tracing::warn!("{} <- {:?}: {e}", endpoint.name(), input);
        }
        result
    }

    fn dispatch(&self, endpoint: Endpoint, input: &str) -> Result<Option<Transition>, GovernorError> {
        match endpoint {
            Endpoint::Manual => {
                let freq = parse_bounded(input, u64::from(u32::MAX))?;
                if freq == 0 {
                    return Err(ControlError::InvalidInput {
                        input: input.to_string(),
                    }
                    .into());
                }
                Ok(Some(self.governor.manual_set(freq as u32)?))
            }
            Endpoint::Android => {
                let cmd = SceneCommand::try_from(parse_ulong(input)?)?;
                Ok(Some(self.governor.scene_set(cmd)?))
            }
            Endpoint::TempCtrl => {
                self.governor
                    .set_flag(ControlFlag::Thermal, parse_ulong(input)?)?;
                Ok(None)
            }
            Endpoint::SceneCtrl => {
                self.governor
                    .set_flag(ControlFlag::Scene, parse_ulong(input)?)?;
                Ok(None)
            }
            Endpoint::Voltage => {
                let vol = parse_bounded(input, u64::from(MAX_VOLTAGE_MV))?;
                self.governor.set_voltage(vol as u32)?;
                Ok(None)
            }
        }
    }

    pub fn read(&self, endpoint: Endpoint) -> String {
        match endpoint {
            Endpoint::Manual | Endpoint::Android => {
                format!("{} MHz\n", self.governor.current_frequency_mhz())
            }
            Endpoint::TempCtrl => self.tempctrl_status(),
            Endpoint::SceneCtrl => {
                format!("{}\n", u8::from(self.governor.flags().scene_ctrl_enabled))
            }
            Endpoint::Voltage => self
                .governor
                .voltage_mv()
                .map(|mv| format!("{mv} mV\n"))
                .unwrap_or_default(),
        }
    }

    fn tempctrl_status(&self) -> String {
        let temperature = self.governor.temperature().unwrap_or_else(|e| {
            tracing::error!("{e}");
            -1
        });
        let mut out = format!(
            "sensor: {}, status: {}, temperature: {}\n",
            self.governor.sensor_id().unwrap_or(0),
            u8::from(self.governor.flags().temp_ctrl_enabled),
            temperature
        );
        if self.governor.capabilities().thermal_table {
            out.push_str("num temperature frequency\n");
            for (i, entry) in self.governor.table().rows().enumerate() {
                let _ = writeln!(
                    out,
                    " {i}     {:3}         {}",
                    entry.temp_threshold, entry.capped_freq_mhz
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{Capabilities, ControlFlags, GovernorSettings, Limits};
    use crate::power_rail::ApplyPolicy;
    use crate::testing::TestRig;
    use crate::thermal_table::{ThermalEntry, ThermalTable};

    fn surface(rig: &TestRig, capabilities: Capabilities) -> ControlSurface {
        let settings = GovernorSettings {
            limits: Limits::new(300, 800, 120),
            flags: ControlFlags {
                temp_ctrl_enabled: true,
                scene_ctrl_enabled: true,
            },
            table: ThermalTable::from_entries(vec![
                ThermalEntry::new(80, 400),
                ThermalEntry::new(60, 600),
            ])
            .unwrap(),
            capabilities,
        };
        let gov = Governor::new(settings, rig.rail(ApplyPolicy::Rollback), Some(rig.sensor()))
            .unwrap();
        ControlSurface::new(Arc::new(gov))
    }

    #[test]
    fn test_parse_ulong() {
        assert_eq!(parse_ulong("42"), Ok(42));
        assert_eq!(parse_ulong("42\n"), Ok(42));
        assert!(parse_ulong("").is_err());
        assert!(parse_ulong("\n").is_err());
        assert!(parse_ulong(" 42").is_err());
        assert!(parse_ulong("-1").is_err());
        assert!(parse_ulong("4x").is_err());
        assert!(parse_ulong("42\n\n").is_err());
        assert!(parse_ulong("99999999999999999999999").is_err());
    }

    #[test]
    fn test_endpoint_names_round_trip() {
        for endpoint in Endpoint::ALL {
            assert_eq!(endpoint.name().parse::<Endpoint>(), Ok(endpoint));
        }
        assert!("dvfs".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_manual_write_and_read() {
        let rig = TestRig::new(&["gpu"]);
        let surface = surface(&rig, Capabilities::default());
        surface.write(Endpoint::Manual, "480\n").unwrap();
        assert_eq!(surface.read(Endpoint::Manual), "480 MHz\n");
        assert_eq!(surface.read(Endpoint::Android), "480 MHz\n");
    }

    #[test]
    fn test_invalid_writes_leave_state_alone() {
        let rig = TestRig::new(&["gpu"]);
        let surface = surface(&rig, Capabilities::default());
        rig.clear_events();

        assert!(surface.write(Endpoint::Manual, "fast").is_err());
        assert!(surface.write(Endpoint::Manual, "0").is_err());
        assert!(surface.write(Endpoint::Android, "2").is_err());
        assert!(surface.write(Endpoint::TempCtrl, "3").is_err());
        assert!(surface.write(Endpoint::SceneCtrl, "yes").is_err());
        assert!(surface.write(Endpoint::Voltage, "1301").is_err());

        assert!(rig.events().is_empty());
        assert_eq!(surface.read(Endpoint::Manual), "300 MHz\n");
        assert_eq!(surface.read(Endpoint::SceneCtrl), "1\n");
    }

    #[test]
    fn test_flag_endpoints() {
        let rig = TestRig::new(&["gpu"]);
        let surface = surface(&rig, Capabilities::default());
        surface.write(Endpoint::SceneCtrl, "0").unwrap();
        assert_eq!(surface.read(Endpoint::SceneCtrl), "0\n");
        assert_eq!(
            surface.write(Endpoint::Android, "1").unwrap(),
            Some(Transition::Dropped(
                crate::governor::DropReason::SceneControlDisabled
            ))
        );
        surface.write(Endpoint::TempCtrl, "0\n").unwrap();
        assert!(!surface.governor().flags().temp_ctrl_enabled);
    }

    #[test]
    fn test_voltage_read_back() {
        let rig = TestRig::new(&["gpu"]);
        let with_regulator = surface(&rig, Capabilities::default());
        with_regulator.write(Endpoint::Voltage, "1100").unwrap();
        assert_eq!(with_regulator.read(Endpoint::Voltage), "1100 mV\n");

        let rig = TestRig::new(&["gpu"]).without_regulator();
        let without_regulator = surface(&rig, Capabilities::default());
        assert_eq!(without_regulator.read(Endpoint::Voltage), "");
    }

    #[test]
    fn test_tempctrl_status_with_table() {
        let rig = TestRig::new(&["gpu"]);
        rig.set_temperature(55);
        let surface = surface(&rig, Capabilities::default());
        assert_eq!(
            surface.read(Endpoint::TempCtrl),
            "sensor: 0, status: 1, temperature: 55\n\
             num temperature frequency\n \
             0      80         400\n \
             1      60         600\n"
        );
    }

    #[test]
    fn test_tempctrl_status_without_table() {
        let rig = TestRig::new(&["gpu"]);
        rig.break_sensor();
        let surface = surface(
            &rig,
            Capabilities {
                thermal_table: false,
                ..Capabilities::default()
            },
        );
        assert_eq!(
            surface.read(Endpoint::TempCtrl),
            "sensor: 0, status: 1, temperature: -1\n"
        );
    }
}
