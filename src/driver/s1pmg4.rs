use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::{extract_f64, extract_input_states, extract_system_telemetry, Driver, DriverId, ParsedStatus};
use crate::model::{ChannelKind, ChannelReading, DeviceInfo, Target};

/// Shelly 1PM Gen4: gen 4, app `S1PMG4`, single switch channel.
pub struct S1PmG4Driver;

impl Driver for S1PmG4Driver {
    fn id(&self) -> DriverId {
        DriverId::S1PmG4
    }

    fn name(&self) -> &'static str {
        "Shelly 1PM Gen4"
    }

    fn score(&self, info: &DeviceInfo) -> i32 {
        if info.gen == 4 && info.app == "S1PMG4" {
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
    reading.output = super::extract_bool(status, "switch:0.output");
    reading.active_power_w = extract_f64(status, "switch:0.apower");
    reading.voltage_v = extract_f64(status, "switch:0.voltage");
    reading.frequency_hz = extract_f64(status, "switch:0.freq");
    reading.current_a = extract_f64(status, "switch:0.current");
    reading.power_factor = extract_f64(status, "switch:0.pf");
    reading.temperature_c = extract_f64(status, "switch:0.temperature.tC");
    reading.total_active_energy_wh = extract_f64(status, "switch:0.aenergy.total");
    reading.total_returned_active_energy_wh = extract_f64(status, "switch:0.ret_aenergy.total");
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
            name: "1pm-gen4-1".into(),
            host: "10.0.0.2".into(),
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
    fn null_temperature_and_missing_pf_are_absent() {
        let driver = S1PmG4Driver;
        let status = json!({
            "switch:0": {
                "output": true,
                "apower": 5.0,
                "voltage": 229.0,
                "current": 0.02,
                "temperature": {"tC": null, "tF": null},
                "aenergy": {"total": 10.0},
            }
        });
        let parsed = driver.parse(&status, &target());
        assert_eq!(parsed.channels.len(), 1);
        let ch = &parsed.channels[0];
        assert_eq!(ch.power_factor, None);
        assert_eq!(ch.temperature_c, None);
        assert_eq!(ch.output, Some(true));
        assert_eq!(ch.active_power_w, Some(5.0));
    }
}
