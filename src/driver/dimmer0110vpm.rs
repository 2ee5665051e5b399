use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::{extract_bool, extract_f64, extract_input_states, extract_system_telemetry, Driver, DriverId, ParsedStatus};
use crate::model::{ChannelKind, ChannelReading, DeviceInfo, Target};

/// Shelly Dimmer 0/1-10V PM: gen 3, app `Dimmer0110VPMG3`, single light
/// channel with brightness and power metering but no frequency/power-factor
/// reporting.
pub struct Dimmer0110VPmDriver;

impl Driver for Dimmer0110VPmDriver {
    fn id(&self) -> DriverId {
        DriverId::Dimmer0110VPm
    }

    fn name(&self) -> &'static str {
        "Shelly Dimmer 0/1-10V PM"
    }

    fn score(&self, info: &DeviceInfo) -> i32 {
        if info.gen == 3 && info.app == "Dimmer0110VPMG3" {
            100
        } else {
            0
        }
    }

    fn supported_channels(&self, _info: &DeviceInfo) -> HashMap<ChannelKind, HashSet<u32>> {
        let mut map = HashMap::new();
        map.insert(ChannelKind::Light, HashSet::from([0]));
        map
    }

    fn parse(&self, status: &Value, target: &Target) -> ParsedStatus {
        let channels = target
            .channels
            .iter()
            .filter(|c| c.kind == ChannelKind::Light && c.index == 0)
            .map(|_| parse_light0(status))
            .collect();

        ParsedStatus {
            channels,
            system: Some(extract_system_telemetry(status)),
            input_states: extract_input_states(status),
        }
    }
}

fn parse_light0(status: &Value) -> ChannelReading {
    let mut reading = ChannelReading::new(ChannelKind::Light, 0);
    reading.output = extract_bool(status, "light:0.output");
    reading.brightness_percent = extract_f64(status, "light:0.brightness");
    reading.active_power_w = extract_f64(status, "light:0.apower");
    reading.total_active_energy_wh = extract_f64(status, "light:0.aenergy.total");
    reading.voltage_v = extract_f64(status, "light:0.voltage");
    reading.current_a = extract_f64(status, "light:0.current");
    reading.temperature_c = extract_f64(status, "light:0.temperature.tC");
    reading
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelSpec, Credentials};
    use serde_json::json;
    use std::time::Duration;

    fn target() -> Target {
        Target {
            name: "dimmer-1".into(),
            host: "10.0.0.4".into(),
            poll_interval: Duration::from_secs(10),
            credentials: Credentials::default(),
            channels: vec![ChannelSpec {
                kind: ChannelKind::Light,
                index: 0,
                ignore: Default::default(),
            }],
        }
    }

    #[test]
    fn light_channel_parses_brightness_and_excludes_switch_fields() {
        let driver = Dimmer0110VPmDriver;
        let status = json!({
            "light:0": {
                "output": true,
                "brightness": 75.0,
                "apower": 8.2,
                "aenergy": {"total": 15.4},
            }
        });
        let parsed = driver.parse(&status, &target());
        assert_eq!(parsed.channels.len(), 1);
        let ch = &parsed.channels[0];
        assert_eq!(ch.kind, ChannelKind::Light);
        assert_eq!(ch.brightness_percent, Some(75.0));
        assert_eq!(ch.active_power_w, Some(8.2));
        assert_eq!(ch.total_active_energy_wh, Some(15.4));
    }
}
