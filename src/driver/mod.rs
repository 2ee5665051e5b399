//! Device identification and JSON-to-reading translation.
//!
//! A [`Driver`] scores a [`DeviceInfo`] and, if selected, turns a
//! `Shelly.GetStatus` payload into [`ChannelReading`]s. The [`DriverRegistry`]
//! is a fixed, ordered list built once at process startup — no reflection,
//! no runtime registration, matching the plain-struct dispatch style of
//! `neomind-devices`'s adapter trait objects.

mod dimmer0110vpm;
mod plugus;
mod pro4pm;
mod s1pmg4;

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::model::{ChannelKind, ChannelReading, DeviceInfo, SystemTelemetry, Target};

/// Stable identifier for a driver, used as the cache key in `PollState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverId {
    Pro4Pm,
    S1PmG4,
    PlugUs,
    Dimmer0110VPm,
}

impl DriverId {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverId::Pro4Pm => "pro4pm",
            DriverId::S1PmG4 => "1pm_gen4",
            DriverId::PlugUs => "plugus",
            DriverId::Dimmer0110VPm => "dimmer_0_1_10v_pm",
        }
    }
}

/// Everything a driver's `parse` produces from one `Shelly.GetStatus` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedStatus {
    pub channels: Vec<ChannelReading>,
    pub system: Option<SystemTelemetry>,
    pub input_states: Vec<bool>,
}

/// A device family driver. Implementations never panic: `parse` is total
/// over any JSON object, per the parse-totality invariant.
pub trait Driver: Send + Sync {
    fn id(&self) -> DriverId;
    fn name(&self) -> &'static str;

    /// Non-negative match strength against this device's identity.
    /// 0 means unsupported.
    fn score(&self, info: &DeviceInfo) -> i32;

    /// The channel slots this device family exposes, by kind.
    fn supported_channels(&self, info: &DeviceInfo) -> HashMap<ChannelKind, HashSet<u32>>;

    /// Translate a raw `Shelly.GetStatus` JSON body into normalized readings.
    fn parse(&self, status: &Value, target: &Target) -> ParsedStatus;
}

/// Process-wide ordered list of driver instances, populated once at startup.
pub struct DriverRegistry {
    drivers: Vec<Box<dyn Driver>>,
}

impl DriverRegistry {
    /// Build the registry with the four shipped drivers, in a fixed order
    /// so that score ties are broken deterministically.
    pub fn with_builtin_drivers() -> Self {
        Self {
            drivers: vec![
                Box::new(pro4pm::Pro4PmDriver),
                Box::new(s1pmg4::S1PmG4Driver),
                Box::new(plugus::PlugUsDriver),
                Box::new(dimmer0110vpm::Dimmer0110VPmDriver),
            ],
        }
    }

    /// Score every driver against `info` and return the first one achieving
    /// the maximum positive score (registration order breaks ties).
    pub fn select(&self, info: &DeviceInfo) -> Option<&dyn Driver> {
        let mut best: Option<(&dyn Driver, i32)> = None;
        for driver in &self.drivers {
            let score = driver.score(info);
            if score <= 0 {
                continue;
            }
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((driver.as_ref(), score)),
            }
        }
        best.map(|(driver, _)| driver)
    }

    pub fn by_id(&self, id: DriverId) -> Option<&dyn Driver> {
        self.drivers.iter().find(|d| d.id() == id).map(|d| d.as_ref())
    }
}

/// Extract a dot-path (e.g. `"aenergy.total"`) from a JSON object, returning
/// `None` on any missing key, JSON null, or non-object intermediate link.
/// Never errors — this is the shared "absent on any break" helper that
/// every driver's field extraction builds on.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        let obj = current.as_object()?;
        current = obj.get(segment)?;
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}

pub fn extract_f64(value: &Value, path: &str) -> Option<f64> {
    extract_path(value, path).and_then(Value::as_f64)
}

pub fn extract_bool(value: &Value, path: &str) -> Option<bool> {
    extract_path(value, path).and_then(Value::as_bool)
}

/// Extracts the `sys`, `wifi`, `cloud`, `mqtt`, and `input:N` subtrees
/// shared across all device families, independent of which channel driver
/// is selected.
pub fn extract_system_telemetry(status: &Value) -> SystemTelemetry {
    SystemTelemetry {
        uptime_seconds: extract_f64(status, "sys.uptime"),
        ram_free_bytes: extract_f64(status, "sys.ram_free"),
        ram_total_bytes: extract_f64(status, "sys.ram_size"),
        fs_free_bytes: extract_f64(status, "sys.fs_free"),
        fs_total_bytes: extract_f64(status, "sys.fs_size"),
        config_revision: extract_f64(status, "sys.cfg_rev"),
        wifi_rssi_dbm: extract_f64(status, "wifi.rssi"),
        wifi_connected: extract_bool(status, "wifi.sta_ip").map(|_| true).or_else(|| {
            extract_path(status, "wifi.status")
                .and_then(Value::as_str)
                .map(|s| s == "got ip" || s == "connected")
        }),
        cloud_connected: extract_bool(status, "cloud.connected"),
        mqtt_connected: extract_bool(status, "mqtt.connected"),
    }
}

/// Extracts `input:0`, `input:1`, ... as a dense boolean vector, stopping
/// at the first missing index.
pub fn extract_input_states(status: &Value) -> Vec<bool> {
    let mut states = Vec::new();
    let mut index = 0u32;
    loop {
        let key = format!("input:{index}");
        match extract_bool(status, &format!("{key}.state")) {
            Some(state) => states.push(state),
            None => break,
        }
        index += 1;
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_path_returns_none_on_missing_and_null() {
        let v = json!({"aenergy": {"total": 12.0}, "temperature": {"tC": null}});
        assert_eq!(extract_f64(&v, "aenergy.total"), Some(12.0));
        assert_eq!(extract_f64(&v, "temperature.tC"), None);
        assert_eq!(extract_f64(&v, "nope.total"), None);
        assert_eq!(extract_f64(&v, "aenergy.total.deeper"), None);
    }

    #[test]
    fn registry_selection_picks_highest_score_with_stable_tie_break() {
        let registry = DriverRegistry::with_builtin_drivers();
        let info = DeviceInfo {
            model: "SPSW-104PE16EU".into(),
            gen: 2,
            app: "Pro4PM".into(),
            mac: "AA:BB".into(),
        };
        let driver = registry.select(&info).expect("driver must match");
        assert_eq!(driver.id(), DriverId::Pro4Pm);
    }

    #[test]
    fn registry_selection_is_none_for_unknown_device() {
        let registry = DriverRegistry::with_builtin_drivers();
        let info = DeviceInfo {
            model: "unknown".into(),
            gen: 99,
            app: "Nope".into(),
            mac: "".into(),
        };
        assert!(registry.select(&info).is_none());
    }
}
