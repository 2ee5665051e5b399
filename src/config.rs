//! YAML configuration schema, defaults, and validation. Produces an
//! immutable [`ConfigSnapshot`]; invalid input is rejected and the caller
//! retains whatever snapshot it already had.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{ChannelKind, ChannelSpec, Credentials, IgnorableField, Target};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    10037
}
fn default_poll_interval_seconds() -> u64 {
    10
}
fn default_request_timeout_seconds() -> u64 {
    3
}
fn default_max_concurrency() -> usize {
    50
}
fn default_device_info_refresh_seconds() -> u64 {
    21600
}
fn default_backoff_base_seconds() -> u64 {
    30
}
fn default_backoff_max_seconds() -> u64 {
    300
}
fn default_scan_interval_seconds() -> u64 {
    300
}
fn default_scan_timeout_seconds() -> u64 {
    1
}
fn default_scan_concurrency() -> usize {
    16
}
fn default_name_template() -> String {
    "{model}-{ip}".to_string()
}
fn default_false() -> bool {
    false
}
fn default_true() -> bool {
    true
}

/// Raw, as-deserialized credential pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl From<RawCredentials> for Credentials {
    fn from(raw: RawCredentials) -> Self {
        Credentials {
            username: raw.username,
            password: raw.password,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawChannelKind {
    Switch,
    Light,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChannel {
    #[serde(rename = "type")]
    pub kind: RawChannelKind,
    pub index: i64,
    #[serde(default = "default_false")]
    pub ignore_voltage: bool,
    #[serde(default = "default_false")]
    pub ignore_current: bool,
    #[serde(default = "default_false")]
    pub ignore_active_power: bool,
    #[serde(default = "default_false")]
    pub ignore_power_factor: bool,
    #[serde(default = "default_false")]
    pub ignore_frequency: bool,
    #[serde(default = "default_false")]
    pub ignore_total_active_energy: bool,
    #[serde(default = "default_false")]
    pub ignore_total_returned_active_energy: bool,
    #[serde(default = "default_false")]
    pub ignore_temperature: bool,
    #[serde(default = "default_false")]
    pub ignore_output: bool,
    #[serde(default = "default_false")]
    pub ignore_brightness: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTarget {
    pub name: String,
    pub url: String,
    pub poll_interval_seconds: Option<u64>,
    pub credentials: Option<RawCredentials>,
    #[serde(default)]
    pub channels: Vec<RawChannel>,
    /// Legacy alias: bare meter indices, sugar for `channels` of kind switch.
    #[serde(default)]
    pub target_meters: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDiscovery {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    #[serde(default)]
    pub network_ranges: Vec<String>,
    #[serde(default = "default_scan_timeout_seconds")]
    pub scan_timeout_seconds: u64,
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    #[serde(default = "default_true")]
    pub auto_add_discovered: bool,
    pub auto_add_credentials: Option<RawCredentials>,
    #[serde(default)]
    pub exclude_ips: Vec<String>,
    #[serde(default = "default_name_template")]
    pub name_template: String,
    pub persist_path: Option<String>,
}

impl Default for RawDiscovery {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            scan_interval_seconds: default_scan_interval_seconds(),
            network_ranges: Vec::new(),
            scan_timeout_seconds: default_scan_timeout_seconds(),
            scan_concurrency: default_scan_concurrency(),
            auto_add_discovered: default_true(),
            auto_add_credentials: None,
            exclude_ips: Vec::new(),
            name_template: default_name_template(),
            persist_path: None,
        }
    }
}

/// The raw, as-deserialized YAML document, before validation/normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_device_info_refresh_seconds")]
    pub device_info_refresh_seconds: u64,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: u64,
    pub default_credentials: Option<RawCredentials>,
    #[serde(default)]
    pub targets: Vec<RawTarget>,
    #[serde(default)]
    pub discovery: RawDiscovery,
}

/// Global settings that survive validation.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub log_level: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub max_concurrency: usize,
    pub device_info_refresh: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub scan_interval: Duration,
    pub network_ranges: Vec<String>,
    pub scan_timeout: Duration,
    pub scan_concurrency: usize,
    pub auto_add_discovered: bool,
    pub auto_add_credentials: Option<Credentials>,
    pub exclude_ips: Vec<String>,
    pub name_template: String,
    pub persist_path: Option<String>,
}

/// An immutable, validated snapshot of the whole configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub global: GlobalSettings,
    pub targets: Vec<Target>,
    pub discovery: DiscoverySettings,
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR"];

pub fn load_from_path(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<ConfigSnapshot, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(text)?;
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<ConfigSnapshot, ConfigError> {
    if !(1..=65535).contains(&(raw.listen_port as u32)) {
        return Err(ConfigError::Validation(format!("listen_port {} out of range 1-65535", raw.listen_port)));
    }
    if raw.poll_interval_seconds < 1 {
        return Err(ConfigError::Validation("poll_interval_seconds must be >= 1".to_string()));
    }
    if raw.max_concurrency < 1 {
        return Err(ConfigError::Validation("max_concurrency must be >= 1".to_string()));
    }
    let log_level = raw.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&log_level.as_str()) {
        return Err(ConfigError::Validation(format!(
            "log_level must be one of {:?}, got {:?}",
            VALID_LOG_LEVELS, raw.log_level
        )));
    }

    let default_credentials: Credentials = raw
        .default_credentials
        .clone()
        .map(Into::into)
        .unwrap_or_default();

    let mut seen_names = HashSet::new();
    let mut targets = Vec::with_capacity(raw.targets.len());
    for raw_target in &raw.targets {
        if !seen_names.insert(raw_target.name.clone()) {
            return Err(ConfigError::Validation(format!("duplicate target name {:?}", raw_target.name)));
        }
        targets.push(validate_target(raw_target, &default_credentials)?);
    }

    let discovery = validate_discovery(raw.discovery, &default_credentials)?;

    Ok(ConfigSnapshot {
        global: GlobalSettings {
            log_level,
            listen_host: raw.listen_host,
            listen_port: raw.listen_port,
            poll_interval: Duration::from_secs(raw.poll_interval_seconds),
            request_timeout: Duration::from_secs(raw.request_timeout_seconds),
            max_concurrency: raw.max_concurrency,
            device_info_refresh: Duration::from_secs(raw.device_info_refresh_seconds),
            backoff_base: Duration::from_secs(raw.backoff_base_seconds),
            backoff_max: Duration::from_secs(raw.backoff_max_seconds),
        },
        targets,
        discovery,
    })
}

fn validate_target(raw: &RawTarget, default_credentials: &Credentials) -> Result<Target, ConfigError> {
    let credentials = raw
        .credentials
        .clone()
        .map(Credentials::from)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| default_credentials.clone());

    let mut channels = Vec::new();
    for raw_channel in &raw.channels {
        channels.push(build_channel(raw_channel, &raw.name)?);
    }
    remap_one_based_indices(&mut channels, &raw.name);

    // `target_meters` is sugar for bare switch channel indices with no
    // ignore flags.
    for &meter_index in &raw.target_meters {
        if meter_index < 0 {
            return Err(ConfigError::Validation(format!(
                "target {:?}: target_meters index {} must be >= 0",
                raw.name, meter_index
            )));
        }
        channels.push(ChannelSpec {
            kind: ChannelKind::Switch,
            index: meter_index as u32,
            ignore: HashSet::new(),
        });
    }

    Ok(Target {
        name: raw.name.clone(),
        host: raw.url.clone(),
        poll_interval: raw
            .poll_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(default_poll_interval_seconds())),
        credentials,
        channels,
    })
}

/// Validates one channel index and builds its `ignore` mask. 1-based vs.
/// 0-based remapping happens afterward, once the per-kind channel count
/// for the whole target is known — see `remap_one_based_indices`.
fn build_channel(raw: &RawChannel, target_name: &str) -> Result<ChannelSpec, ConfigError> {
    if raw.index < 0 {
        return Err(ConfigError::Validation(format!(
            "target {:?}: channel index {} must be >= 0",
            target_name, raw.index
        )));
    }
    let index = raw.index as u32;

    let kind = match raw.kind {
        RawChannelKind::Switch => ChannelKind::Switch,
        RawChannelKind::Light => ChannelKind::Light,
    };

    let mut ignore = HashSet::new();
    if raw.ignore_voltage {
        ignore.insert(IgnorableField::Voltage);
    }
    if raw.ignore_current {
        ignore.insert(IgnorableField::Current);
    }
    if raw.ignore_active_power {
        ignore.insert(IgnorableField::ActivePower);
    }
    if raw.ignore_power_factor {
        ignore.insert(IgnorableField::PowerFactor);
    }
    if raw.ignore_frequency {
        ignore.insert(IgnorableField::Frequency);
    }
    if raw.ignore_total_active_energy {
        ignore.insert(IgnorableField::TotalActiveEnergy);
    }
    if raw.ignore_total_returned_active_energy {
        ignore.insert(IgnorableField::TotalReturnedActiveEnergy);
    }
    if raw.ignore_temperature {
        ignore.insert(IgnorableField::Temperature);
    }
    if raw.ignore_output {
        ignore.insert(IgnorableField::Output);
    }
    if raw.ignore_brightness {
        ignore.insert(IgnorableField::Brightness);
    }

    Ok(ChannelSpec { kind, index, ignore })
}

/// If a channel's index equals the total channel count for its kind on
/// this target, the configuration almost certainly used 1-based numbering;
/// remap that one channel down to 0-based and warn. Leaves every other
/// index untouched.
fn remap_one_based_indices(channels: &mut [ChannelSpec], target_name: &str) {
    for kind in [ChannelKind::Switch, ChannelKind::Light] {
        let count = channels.iter().filter(|c| c.kind == kind).count() as u32;
        if count == 0 {
            continue;
        }
        for channel in channels.iter_mut().filter(|c| c.kind == kind) {
            if channel.index == count {
                tracing::warn!(
                    target = target_name,
                    kind = kind.as_str(),
                    from = channel.index,
                    to = channel.index - 1,
                    "channel index looked 1-based; remapping to 0-based"
                );
                channel.index -= 1;
            }
        }
    }
}

fn validate_discovery(raw: RawDiscovery, default_credentials: &Credentials) -> Result<DiscoverySettings, ConfigError> {
    if raw.enabled && raw.scan_concurrency < 1 {
        return Err(ConfigError::Validation("discovery.scan_concurrency must be >= 1".to_string()));
    }
    let auto_add_credentials = raw
        .auto_add_credentials
        .map(Credentials::from)
        .filter(|c| !c.is_empty())
        .or_else(|| {
            if default_credentials.is_empty() {
                None
            } else {
                Some(default_credentials.clone())
            }
        });

    Ok(DiscoverySettings {
        enabled: raw.enabled,
        scan_interval: Duration::from_secs(raw.scan_interval_seconds),
        network_ranges: raw.network_ranges,
        scan_timeout: Duration::from_secs(raw.scan_timeout_seconds),
        scan_concurrency: raw.scan_concurrency,
        auto_add_discovered: raw.auto_add_discovered,
        auto_add_credentials,
        exclude_ips: raw.exclude_ips,
        name_template: raw.name_template,
        persist_path: raw.persist_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_applies_defaults() {
        let yaml = "targets: []\n";
        let snapshot = load_from_str(yaml).unwrap();
        assert_eq!(snapshot.global.listen_port, 10037);
        assert_eq!(snapshot.global.max_concurrency, 50);
        assert_eq!(snapshot.global.log_level, "INFO");
        assert!(!snapshot.discovery.enabled);
    }

    #[test]
    fn rejects_out_of_range_port() {
        let yaml = "listen_port: 70000\ntargets: []\n";
        assert!(matches!(load_from_str(yaml), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_duplicate_target_names() {
        let yaml = r#"
targets:
  - name: a
    url: 10.0.0.1
  - name: a
    url: 10.0.0.2
"#;
        assert!(matches!(load_from_str(yaml), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn target_meters_is_sugar_for_switch_channels() {
        let yaml = r#"
targets:
  - name: a
    url: 10.0.0.1
    target_meters: [0, 1]
"#;
        let snapshot = load_from_str(yaml).unwrap();
        let target = &snapshot.targets[0];
        assert_eq!(target.channels.len(), 2);
        assert!(target.channels.iter().all(|c| c.kind == ChannelKind::Switch));
    }

    #[test]
    fn credential_precedence_is_target_then_default_then_none() {
        let yaml = r#"
default_credentials:
  username: defaultuser
  password: defaultpass
targets:
  - name: a
    url: 10.0.0.1
  - name: b
    url: 10.0.0.2
    credentials:
      username: targetuser
      password: targetpass
"#;
        let snapshot = load_from_str(yaml).unwrap();
        let a = snapshot.targets.iter().find(|t| t.name == "a").unwrap();
        let b = snapshot.targets.iter().find(|t| t.name == "b").unwrap();
        assert_eq!(a.credentials.username, "defaultuser");
        assert_eq!(b.credentials.username, "targetuser");
    }
}
