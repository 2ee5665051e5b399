use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::{extract_bool, extract_f64, extract_input_states, extract_system_telemetry, Driver, DriverId, ParsedStatus};
use crate::model::{ChannelKind, ChannelReading, DeviceInfo, Target};

/// Shelly Plug US: gen 2, app `PlugUS`, single switch channel, no
/// frequency/power-factor/return-energy metering.
pub struct PlugUsDriver;

impl Driver for PlugUsDriver {
    fn id(&self) -> DriverId {
        DriverId::PlugUs
    }

    fn name(&self) -> &'static str {
        "Shelly Plug US"
    }

    fn score(&self, info: &DeviceInfo) -> i32 {
        if info.gen == 2 && info.app == "PlugUS" {
            100
        } else {
            0
        }
    }

    fn supported_channels(&self, _info: &DeviceInfo) -> HashMap<ChannelKind, HashSet<u32>> {
        let mut map = HashMap::new();
        map.insert(ChannelKind::Switch, HashSet::from([0]));
        map
    }

    fn parse(&self, status: &Value, target: &Target) -> ParsedStatus {
        let channels = target
            .channels
            .iter()
            .filter(|c| c.kind == ChannelKind::Switch && c.index == 0)
            .map(|_| parse_switch0(status))
            .collect();

        ParsedStatus {
            channels,
            system: Some(extract_system_telemetry(status)),
            input_states: extract_input_states(status),
        }
    }
}

fn parse_switch0(status: &Value) -> ChannelReading {
    let mut reading = ChannelReading::new(ChannelKind::Switch, 0);
    reading.output = extract_bool(status, "switch:0.output");
    reading.active_power_w = extract_f64(status, "switch:0.apower");
    reading.voltage_v = extract_f64(status, "switch:0.voltage");
    reading.current_a = extract_f64(status, "switch:0.current");
    reading.temperature_c = extract_f64(status, "switch:0.temperature.tC");
    reading.total_active_energy_wh = extract_f64(status, "switch:0.aenergy.total");
    // PlugUS does not report frequency, power factor, or returned energy;
    // leaving these fields as None rather than probing for keys that
    // never appear on this family.
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
            name: "plugus-1".into(),
            host: "10.0.0.3".into(),
            poll_interval: Duration::from_secs(10),
            credentials: Credentials::default(),
            channels: vec![ChannelSpec {
                kind: ChannelKind::Switch,
                index: 0,
                ignore: Default::default(),
            }],
        }
    }

    #[test]
    fn minimal_payload_sets_only_reported_fields() {
        let driver = PlugUsDriver;
        let status = json!({
            "switch:0": {
                "output": true,
                "apower": 3.2,
                "voltage": 120.5,
                "current": 0.03,
                "temperature": {"tC": 33.0},
                "aenergy": {"total": 55.0},
            }
        });
        let parsed = driver.parse(&status, &target());
        let ch = &parsed.channels[0];
        assert_eq!(ch.output, Some(true));
        assert_eq!(ch.active_power_w, Some(3.2));
        assert_eq!(ch.voltage_v, Some(120.5));
        assert_eq!(ch.current_a, Some(0.03));
        assert_eq!(ch.temperature_c, Some(33.0));
        assert_eq!(ch.total_active_energy_wh, Some(55.0));
        assert_eq!(ch.frequency_hz, None);
        assert_eq!(ch.power_factor, None);
        assert_eq!(ch.total_returned_active_energy_wh, None);
    }
}
