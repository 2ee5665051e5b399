//! Facade over a `prometheus::Registry`. Creates and memoizes every metric
//! named in the catalog; callers never touch a raw `GaugeVec` directly.

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::model::{ChannelKind, ChannelReading, DeviceReading, IgnorableField};

pub struct MetricRegistry {
    registry: Registry,

    up: GaugeVec,
    last_poll_timestamp: GaugeVec,
    poll_duration: GaugeVec,
    poll_errors_total: CounterVec,

    sys_uptime: GaugeVec,
    sys_ram_free: GaugeVec,
    sys_ram_total: GaugeVec,
    sys_fs_free: GaugeVec,
    sys_fs_total: GaugeVec,
    config_revision: GaugeVec,
    wifi_rssi: GaugeVec,
    wifi_connected: GaugeVec,
    cloud_connected: GaugeVec,
    mqtt_connected: GaugeVec,
    input_state: GaugeVec,

    switch_output: GaugeVec,
    switch_apower_watts: GaugeVec,
    switch_voltage_volts: GaugeVec,
    switch_frequency_hz: GaugeVec,
    switch_current_amps: GaugeVec,
    switch_power_factor: GaugeVec,
    switch_temperature_c: GaugeVec,
    switch_aenergy_wh_total: GaugeVec,
    switch_ret_aenergy_wh_total: GaugeVec,

    light_output: GaugeVec,
    light_brightness_percent: GaugeVec,
    light_apower_watts: GaugeVec,
    light_aenergy_wh_total: GaugeVec,
    light_voltage_volts: GaugeVec,
    light_current_amps: GaugeVec,
    light_temperature_c: GaugeVec,

    discovered_targets_total: prometheus::Counter,
    discovered_device_info: GaugeVec,
    discovery_scan_duration: prometheus::Gauge,
    discovery_scan_errors_total: prometheus::Counter,

    config_reloads_total: prometheus::Counter,
    config_reload_errors_total: prometheus::Counter,
    config_last_reload_timestamp: prometheus::Gauge,
    config_last_reload_status: prometheus::Gauge,
}

macro_rules! register_gauge_vec {
    ($registry:expr, $name:expr, $help:expr, $labels:expr) => {{
        let vec = GaugeVec::new(Opts::new($name, $help), $labels).expect("static metric definition");
        $registry.register(Box::new(vec.clone())).expect("metric name must be unique");
        vec
    }};
}

macro_rules! register_counter_vec {
    ($registry:expr, $name:expr, $help:expr, $labels:expr) => {{
        let vec = CounterVec::new(Opts::new($name, $help), $labels).expect("static metric definition");
        $registry.register(Box::new(vec.clone())).expect("metric name must be unique");
        vec
    }};
}

macro_rules! register_gauge {
    ($registry:expr, $name:expr, $help:expr) => {{
        let gauge = prometheus::Gauge::new($name, $help).expect("static metric definition");
        $registry.register(Box::new(gauge.clone())).expect("metric name must be unique");
        gauge
    }};
}

macro_rules! register_counter {
    ($registry:expr, $name:expr, $help:expr) => {{
        let counter = prometheus::Counter::new($name, $help).expect("static metric definition");
        $registry.register(Box::new(counter.clone())).expect("metric name must be unique");
        counter
    }};
}

impl MetricRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();
        let dev = &["device"];
        let switch = &["device", "meter"];
        let light = &["device", "channel"];

        Self {
            up: register_gauge_vec!(registry, "shelly_up", "Whether the last poll of the device succeeded", dev),
            last_poll_timestamp: register_gauge_vec!(
                registry,
                "shelly_last_poll_timestamp_seconds",
                "Unix timestamp of the last poll attempt",
                dev
            ),
            poll_duration: register_gauge_vec!(
                registry,
                "shelly_poll_duration_seconds",
                "Duration of the last poll attempt",
                dev
            ),
            poll_errors_total: register_counter_vec!(
                registry,
                "shelly_poll_errors_total",
                "Total number of failed polls",
                dev
            ),

            sys_uptime: register_gauge_vec!(registry, "shelly_sys_uptime_seconds", "Device uptime", dev),
            sys_ram_free: register_gauge_vec!(registry, "shelly_sys_ram_free_bytes", "Free RAM", dev),
            sys_ram_total: register_gauge_vec!(registry, "shelly_sys_ram_total_bytes", "Total RAM", dev),
            sys_fs_free: register_gauge_vec!(registry, "shelly_sys_fs_free_bytes", "Free filesystem bytes", dev),
            sys_fs_total: register_gauge_vec!(registry, "shelly_sys_fs_total_bytes", "Total filesystem bytes", dev),
            config_revision: register_gauge_vec!(
                registry,
                "shelly_sys_config_revision",
                "Device-side configuration revision counter",
                dev
            ),
            wifi_rssi: register_gauge_vec!(registry, "shelly_wifi_rssi_dbm", "WiFi signal strength", dev),
            wifi_connected: register_gauge_vec!(registry, "shelly_wifi_connected", "Whether WiFi is connected", dev),
            cloud_connected: register_gauge_vec!(registry, "shelly_cloud_connected", "Whether the cloud link is connected", dev),
            mqtt_connected: register_gauge_vec!(registry, "shelly_mqtt_connected", "Whether MQTT is connected", dev),
            input_state: register_gauge_vec!(
                registry,
                "shelly_input_state",
                "State of a digital input",
                &["device", "input"]
            ),

            switch_output: register_gauge_vec!(registry, "shelly_switch_output", "Switch output state", switch),
            switch_apower_watts: register_gauge_vec!(registry, "shelly_switch_apower_watts", "Switch active power", switch),
            switch_voltage_volts: register_gauge_vec!(registry, "shelly_switch_voltage_volts", "Switch line voltage", switch),
            switch_frequency_hz: register_gauge_vec!(registry, "shelly_switch_frequency_hz", "Switch line frequency", switch),
            switch_current_amps: register_gauge_vec!(registry, "shelly_switch_current_amps", "Switch current", switch),
            switch_power_factor: register_gauge_vec!(registry, "shelly_switch_power_factor", "Switch power factor", switch),
            switch_temperature_c: register_gauge_vec!(registry, "shelly_switch_temperature_c", "Switch temperature", switch),
            switch_aenergy_wh_total: register_gauge_vec!(
                registry,
                "shelly_switch_aenergy_wh_total",
                "Switch total active energy",
                switch
            ),
            switch_ret_aenergy_wh_total: register_gauge_vec!(
                registry,
                "shelly_switch_ret_aenergy_wh_total",
                "Switch total returned active energy",
                switch
            ),

            light_output: register_gauge_vec!(registry, "shelly_light_output", "Light output state", light),
            light_brightness_percent: register_gauge_vec!(
                registry,
                "shelly_light_brightness_percent",
                "Light brightness",
                light
            ),
            light_apower_watts: register_gauge_vec!(registry, "shelly_light_apower_watts", "Light active power", light),
            light_aenergy_wh_total: register_gauge_vec!(
                registry,
                "shelly_light_aenergy_wh_total",
                "Light total active energy",
                light
            ),
            light_voltage_volts: register_gauge_vec!(registry, "shelly_light_voltage_volts", "Light line voltage", light),
            light_current_amps: register_gauge_vec!(registry, "shelly_light_current_amps", "Light current", light),
            light_temperature_c: register_gauge_vec!(registry, "shelly_light_temperature_c", "Light temperature", light),

            discovered_targets_total: register_counter!(
                registry,
                "shelly_discovered_targets_total",
                "Total number of targets auto-added by discovery"
            ),
            discovered_device_info: register_gauge_vec!(
                registry,
                "shelly_discovered_device_info",
                "Info about a discovered device, value always 1",
                &["ip", "model", "gen", "app", "mac", "discovered_at"]
            ),
            discovery_scan_duration: register_gauge!(
                registry,
                "shelly_discovery_scan_duration_seconds",
                "Duration of the last discovery scan"
            ),
            discovery_scan_errors_total: register_counter!(
                registry,
                "shelly_discovery_scan_errors_total",
                "Total number of probe failures during discovery"
            ),

            config_reloads_total: register_counter!(
                registry,
                "shelly_config_reloads_total",
                "Total number of applied config reloads"
            ),
            config_reload_errors_total: register_counter!(
                registry,
                "shelly_config_reload_errors_total",
                "Total number of rejected config reloads"
            ),
            config_last_reload_timestamp: register_gauge!(
                registry,
                "shelly_config_last_reload_timestamp_seconds",
                "Unix timestamp of the last reload attempt"
            ),
            config_last_reload_status: register_gauge!(
                registry,
                "shelly_config_last_reload_status",
                "1 if the last reload attempt succeeded, 0 otherwise"
            ),

            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn encode_text(&self) -> Vec<u8> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .expect("text encoding of well-formed metric families cannot fail");
        buffer
    }

    pub fn record_success(&self, device: &str, reading: &DeviceReading) {
        self.up.with_label_values(&[device]).set(1.0);
        self.last_poll_timestamp
            .with_label_values(&[device])
            .set(unix_timestamp_seconds());
        self.poll_duration
            .with_label_values(&[device])
            .set(reading.poll_duration.as_secs_f64());

        if let Some(sys) = &reading.system {
            set_optional(&self.sys_uptime, &[device], sys.uptime_seconds);
            set_optional(&self.sys_ram_free, &[device], sys.ram_free_bytes);
            set_optional(&self.sys_ram_total, &[device], sys.ram_total_bytes);
            set_optional(&self.sys_fs_free, &[device], sys.fs_free_bytes);
            set_optional(&self.sys_fs_total, &[device], sys.fs_total_bytes);
            set_optional(&self.config_revision, &[device], sys.config_revision);
            set_optional(&self.wifi_rssi, &[device], sys.wifi_rssi_dbm);
            set_optional_bool(&self.wifi_connected, &[device], sys.wifi_connected);
            set_optional_bool(&self.cloud_connected, &[device], sys.cloud_connected);
            set_optional_bool(&self.mqtt_connected, &[device], sys.mqtt_connected);
        }

        for (index, state) in reading.input_states.iter().enumerate() {
            self.input_state
                .with_label_values(&[device, &index.to_string()])
                .set(if *state { 1.0 } else { 0.0 });
        }
    }

    pub fn record_failure(&self, device: &str) {
        self.up.with_label_values(&[device]).set(0.0);
        self.last_poll_timestamp
            .with_label_values(&[device])
            .set(unix_timestamp_seconds());
        self.poll_errors_total.with_label_values(&[device]).inc();
    }

    /// Apply one channel's reading, honoring the ignore mask: a field is
    /// only ever written when the channel is configured and the field is
    /// present and not suppressed.
    pub fn record_channel(&self, device: &str, reading: &ChannelReading, ignore: &std::collections::HashSet<IgnorableField>) {
        match reading.kind {
            ChannelKind::Switch => {
                let meter = reading.index.to_string();
                let labels = [device, meter.as_str()];
                if !ignore.contains(&IgnorableField::Output) {
                    set_optional_bool(&self.switch_output, &labels, reading.output);
                }
                if !ignore.contains(&IgnorableField::ActivePower) {
                    set_optional(&self.switch_apower_watts, &labels, reading.active_power_w);
                }
                if !ignore.contains(&IgnorableField::Voltage) {
                    set_optional(&self.switch_voltage_volts, &labels, reading.voltage_v);
                }
                if !ignore.contains(&IgnorableField::Frequency) {
                    set_optional(&self.switch_frequency_hz, &labels, reading.frequency_hz);
                }
                if !ignore.contains(&IgnorableField::Current) {
                    set_optional(&self.switch_current_amps, &labels, reading.current_a);
                }
                if !ignore.contains(&IgnorableField::PowerFactor) {
                    set_optional(&self.switch_power_factor, &labels, reading.power_factor);
                }
                if !ignore.contains(&IgnorableField::Temperature) {
                    set_optional(&self.switch_temperature_c, &labels, reading.temperature_c);
                }
                if !ignore.contains(&IgnorableField::TotalActiveEnergy) {
                    set_optional(&self.switch_aenergy_wh_total, &labels, reading.total_active_energy_wh);
                }
                if !ignore.contains(&IgnorableField::TotalReturnedActiveEnergy) {
                    set_optional(
                        &self.switch_ret_aenergy_wh_total,
                        &labels,
                        reading.total_returned_active_energy_wh,
                    );
                }
            }
            ChannelKind::Light => {
                let channel = reading.index.to_string();
                let labels = [device, channel.as_str()];
                if !ignore.contains(&IgnorableField::Output) {
                    set_optional_bool(&self.light_output, &labels, reading.output);
                }
                if !ignore.contains(&IgnorableField::Brightness) {
                    set_optional(&self.light_brightness_percent, &labels, reading.brightness_percent);
                }
                if !ignore.contains(&IgnorableField::ActivePower) {
                    set_optional(&self.light_apower_watts, &labels, reading.active_power_w);
                }
                if !ignore.contains(&IgnorableField::TotalActiveEnergy) {
                    set_optional(&self.light_aenergy_wh_total, &labels, reading.total_active_energy_wh);
                }
                if !ignore.contains(&IgnorableField::Voltage) {
                    set_optional(&self.light_voltage_volts, &labels, reading.voltage_v);
                }
                if !ignore.contains(&IgnorableField::Current) {
                    set_optional(&self.light_current_amps, &labels, reading.current_a);
                }
                if !ignore.contains(&IgnorableField::Temperature) {
                    set_optional(&self.light_temperature_c, &labels, reading.temperature_c);
                }
            }
        }
    }

    /// Delete every series labelled with this device across all per-device
    /// and per-channel metrics, called when a target is removed to avoid
    /// staleness.
    pub fn remove_device(&self, device: &str) {
        for vec in [
            &self.up,
            &self.last_poll_timestamp,
            &self.poll_duration,
            &self.sys_uptime,
            &self.sys_ram_free,
            &self.sys_ram_total,
            &self.sys_fs_free,
            &self.sys_fs_total,
            &self.config_revision,
            &self.wifi_rssi,
            &self.wifi_connected,
            &self.cloud_connected,
            &self.mqtt_connected,
        ] {
            let _ = vec.remove_label_values(&[device]);
        }
        let _ = self.poll_errors_total.remove_label_values(&[device]);
        self.remove_matching(&self.input_state, device);
        self.remove_matching(&self.switch_output, device);
        self.remove_matching(&self.switch_apower_watts, device);
        self.remove_matching(&self.switch_voltage_volts, device);
        self.remove_matching(&self.switch_frequency_hz, device);
        self.remove_matching(&self.switch_current_amps, device);
        self.remove_matching(&self.switch_power_factor, device);
        self.remove_matching(&self.switch_temperature_c, device);
        self.remove_matching(&self.switch_aenergy_wh_total, device);
        self.remove_matching(&self.switch_ret_aenergy_wh_total, device);
        self.remove_matching(&self.light_output, device);
        self.remove_matching(&self.light_brightness_percent, device);
        self.remove_matching(&self.light_apower_watts, device);
        self.remove_matching(&self.light_aenergy_wh_total, device);
        self.remove_matching(&self.light_voltage_volts, device);
        self.remove_matching(&self.light_current_amps, device);
        self.remove_matching(&self.light_temperature_c, device);
    }

    /// `GaugeVec::remove_label_values` requires the exact label set; since
    /// switch/light/input vecs carry a second label we don't know here, we
    /// scan the gathered families for matching `device` labels instead.
    fn remove_matching(&self, vec: &GaugeVec, device: &str) {
        let metric_family = vec.collect();
        for family in metric_family {
            for metric in family.get_metric() {
                let mut label_values: Vec<&str> = Vec::new();
                let mut matches_device = false;
                for label in metric.get_label() {
                    if label.get_name() == "device" && label.get_value() == device {
                        matches_device = true;
                    }
                    label_values.push(label.get_value());
                }
                if matches_device {
                    let _ = vec.remove_label_values(&label_values);
                }
            }
        }
    }

    pub fn record_discovery_scan(&self, duration_seconds: f64, probe_errors: u64) {
        self.discovery_scan_duration.set(duration_seconds);
        if probe_errors > 0 {
            self.discovery_scan_errors_total.inc_by(probe_errors as f64);
        }
    }

    pub fn record_discovered_device(&self, ip: &str, model: &str, gen: i64, app: &str, mac: &str, discovered_at: &str) {
        self.discovered_targets_total.inc();
        self.discovered_device_info
            .with_label_values(&[ip, model, &gen.to_string(), app, mac, discovered_at])
            .set(1.0);
    }

    pub fn record_reload(&self, success: bool) {
        self.config_reloads_total.inc();
        if !success {
            self.config_reload_errors_total.inc();
        }
        self.config_last_reload_timestamp.set(unix_timestamp_seconds());
        self.config_last_reload_status.set(if success { 1.0 } else { 0.0 });
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn set_optional(vec: &GaugeVec, labels: &[&str], value: Option<f64>) {
    if let Some(v) = value {
        vec.with_label_values(labels).set(v);
    }
}

fn set_optional_bool(vec: &GaugeVec, labels: &[&str], value: Option<bool>) {
    if let Some(v) = value {
        vec.with_label_values(labels).set(if v { 1.0 } else { 0.0 });
    }
}

fn unix_timestamp_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelReading;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn record_success_sets_up_and_per_device_gauges() {
        let metrics = MetricRegistry::new();
        let reading = DeviceReading {
            up: true,
            poll_duration: Duration::from_millis(42),
            channels: vec![],
            system: None,
            input_states: vec![],
        };
        metrics.record_success("dev-1", &reading);
        let families = metrics.registry().gather();
        let up_family = families.iter().find(|f| f.get_name() == "shelly_up").unwrap();
        assert_eq!(up_family.get_metric()[0].get_gauge().get_value(), 1.0);
    }

    #[test]
    fn ignore_mask_suppresses_a_single_field() {
        let metrics = MetricRegistry::new();
        let mut reading = ChannelReading::new(ChannelKind::Switch, 0);
        reading.active_power_w = Some(12.3);
        reading.voltage_v = Some(230.0);
        let mut ignore = HashSet::new();
        ignore.insert(IgnorableField::ActivePower);
        metrics.record_channel("dev-2", &reading, &ignore);

        let families = metrics.registry().gather();
        let apower = families.iter().find(|f| f.get_name() == "shelly_switch_apower_watts").unwrap();
        assert!(apower.get_metric().is_empty());
        let voltage = families.iter().find(|f| f.get_name() == "shelly_switch_voltage_volts").unwrap();
        assert_eq!(voltage.get_metric()[0].get_gauge().get_value(), 230.0);
    }

    #[test]
    fn remove_device_deletes_series() {
        let metrics = MetricRegistry::new();
        metrics.record_failure("dev-3");
        metrics.remove_device("dev-3");
        let families = metrics.registry().gather();
        let up_family = families.iter().find(|f| f.get_name() == "shelly_up").unwrap();
        assert!(up_family.get_metric().is_empty());
    }
}
