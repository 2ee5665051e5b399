use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::{extract_f64, extract_input_states, extract_path, extract_system_telemetry, Driver, DriverId, ParsedStatus};
use crate::model::{ChannelKind, ChannelReading, DeviceInfo, Target};

/// Shelly Pro 4PM: gen 2, app `Pro4PM`, four switch channels with full
/// power metering.
pub struct Pro4PmDriver;

impl Driver for Pro4PmDriver {
    fn id(&self) -> DriverId {
        DriverId::Pro4Pm
    }

    fn name(&self) -> &'static str {
        "Shelly Pro 4PM"
    }

    fn score(&self, info: &DeviceInfo) -> i32 {
        if info.gen == 2 && info.app == "Pro4PM" {
            100
        } else {
            0
        }
    }

    fn supported_channels(&self, _info: &DeviceInfo) -> HashMap<ChannelKind, HashSet<u32>> {
        let mut map = HashMap::new();
        map.insert(ChannelKind::Switch, (0..4).collect());
        map
    }

    fn parse(&self, status: &Value, target: &Target) -> ParsedStatus {
        let channels = target
            .channels
            .iter()
            .filter(|c| c.kind == ChannelKind::Switch && c.index < 4)
            .map(|spec| parse_switch_channel(status, spec.index))
            .collect();

        ParsedStatus {
            channels,
            system: Some(extract_system_telemetry(status)),
            input_states: extract_input_states(status),
        }
    }
}

fn parse_switch_channel(status: &Value, index: u32) -> ChannelReading {
    let key = format!("switch:{index}");
    let mut reading = ChannelReading::new(ChannelKind::Switch, index);
    reading.output = extract_path(status, &format!("{key}.output")).and_then(Value::as_bool);
    reading.active_power_w = extract_f64(status, &format!("{key}.apower"));
    reading.voltage_v = extract_f64(status, &format!("{key}.voltage"));
    reading.frequency_hz = extract_f64(status, &format!("{key}.freq"));
    reading.current_a = extract_f64(status, &format!("{key}.current"));
    reading.power_factor = extract_f64(status, &format!("{key}.pf"));
    reading.temperature_c = extract_f64(status, &format!("{key}.temperature.tC"));
    reading.total_active_energy_wh = extract_f64(status, &format!("{key}.aenergy.total"));
    reading.total_returned_active_energy_wh = extract_f64(status, &format!("{key}.ret_aenergy.total"));
    reading
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelSpec, Credentials};
    use serde_json::json;
    use std::time::Duration;

    fn target_with_switches(n: u32) -> Target {
        Target {
            name: "pro4pm-1".into(),
            host: "10.0.0.1".into(),
            poll_interval: Duration::from_secs(10),
            credentials: Credentials::default(),
            channels: (0..n)
                .map(|i| ChannelSpec {
                    kind: ChannelKind::Switch,
                    index: i,
                    ignore: Default::default(),
                })
                .collect(),
        }
    }

    #[test]
    fn happy_path_all_four_meters() {
        let driver = Pro4PmDriver;
        let target = target_with_switches(4);
        let mut status = serde_json::Map::new();
        for i in 0..4 {
            status.insert(
                format!("switch:{i}"),
                json!({
                    "output": true,
                    "apower": 12.3,
                    "voltage": 230.1,
                    "freq": 50.0,
                    "current": 0.054,
                    "pf": 0.98,
                    "temperature": {"tC": 42.1},
                    "aenergy": {"total": 1234.5},
                    "ret_aenergy": {"total": 0.0},
                }),
            );
        }
        let parsed = driver.parse(&Value::Object(status), &target);
        assert_eq!(parsed.channels.len(), 4);
        for reading in &parsed.channels {
            assert_eq!(reading.active_power_w, Some(12.3));
            assert_eq!(reading.output, Some(true));
            assert_eq!(reading.total_returned_active_energy_wh, Some(0.0));
        }
    }

    #[test]
    fn parse_is_total_over_empty_payload() {
        let driver = Pro4PmDriver;
        let target = target_with_switches(4);
        let parsed = driver.parse(&json!({}), &target);
        assert_eq!(parsed.channels.len(), 4);
        assert!(parsed.channels.iter().all(|c| c.output.is_none()));
    }

    #[test]
    fn score_requires_exact_gen_and_app() {
        let driver = Pro4PmDriver;
        let info = DeviceInfo {
            model: "x".into(),
            gen: 2,
            app: "PlugUS".into(),
            mac: "".into(),
        };
        assert_eq!(driver.score(&info), 0);
    }
}
