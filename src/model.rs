//! Core data model: targets, channels, device readings, and the live
//! registry that the scheduler, config watcher, and network scanner share.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::driver::DriverId;

/// Which metric fields a channel's ignore mask can suppress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnorableField {
    Voltage,
    Current,
    ActivePower,
    PowerFactor,
    Frequency,
    TotalActiveEnergy,
    TotalReturnedActiveEnergy,
    Temperature,
    Output,
    Brightness,
}

/// Kind of channel a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Switch,
    Light,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Switch => "switch",
            ChannelKind::Light => "light",
        }
    }
}

/// A configured channel slot on a target.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub kind: ChannelKind,
    pub index: u32,
    pub ignore: HashSet<IgnorableField>,
}

impl ChannelSpec {
    pub fn is_ignored(&self, field: IgnorableField) -> bool {
        self.ignore.contains(&field)
    }

    pub fn source_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.index)
    }
}

/// Credentials resolved for a single target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

/// A logical polling unit, produced by the config loader or the scanner.
///
/// Identity for diffing purposes is `(name, host)`; a `Target` is never
/// mutated in place, only replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub host: String,
    pub poll_interval: Duration,
    pub credentials: Credentials,
    pub channels: Vec<ChannelSpec>,
}

impl Target {
    pub fn registry_key(&self) -> (String, String) {
        (self.name.clone(), normalize_host(&self.host))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

/// Cached result of the `Shelly.GetDeviceInfo` RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub model: String,
    pub gen: i64,
    pub app: String,
    pub mac: String,
}

/// Normalized per-channel telemetry produced fresh on every poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelReading {
    pub kind: ChannelKind,
    pub index: u32,
    pub output: Option<bool>,
    pub brightness_percent: Option<f64>,
    pub active_power_w: Option<f64>,
    pub voltage_v: Option<f64>,
    pub frequency_hz: Option<f64>,
    pub current_a: Option<f64>,
    pub power_factor: Option<f64>,
    pub temperature_c: Option<f64>,
    pub total_active_energy_wh: Option<f64>,
    pub total_returned_active_energy_wh: Option<f64>,
}

impl Default for ChannelKind {
    fn default() -> Self {
        ChannelKind::Switch
    }
}

impl ChannelReading {
    pub fn new(kind: ChannelKind, index: u32) -> Self {
        Self {
            kind,
            index,
            ..Default::default()
        }
    }
}

/// Optional system/network telemetry extracted independently of the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemTelemetry {
    pub uptime_seconds: Option<f64>,
    pub ram_free_bytes: Option<f64>,
    pub ram_total_bytes: Option<f64>,
    pub fs_free_bytes: Option<f64>,
    pub fs_total_bytes: Option<f64>,
    pub config_revision: Option<f64>,
    pub wifi_rssi_dbm: Option<f64>,
    pub wifi_connected: Option<bool>,
    pub cloud_connected: Option<bool>,
    pub mqtt_connected: Option<bool>,
}

/// Per-poll metadata plus whatever channel readings were parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub up: bool,
    pub poll_duration: Duration,
    pub channels: Vec<ChannelReading>,
    pub system: Option<SystemTelemetry>,
    pub input_states: Vec<bool>,
}

/// Output of the network scanner: an identified, addressable device.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub info: DeviceInfo,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
    pub derived_name: String,
}

/// Mutable per-target scheduling state. The scheduler is the sole writer;
/// the loader and scanner only ever replace the `Target` half of a live
/// entry, never this struct.
#[derive(Debug, Clone)]
pub struct PollState {
    pub next_run: Instant,
    pub consecutive_failures: u32,
    pub device_info: Option<DeviceInfo>,
    pub device_info_refreshed_at: Option<Instant>,
    pub driver: Option<DriverId>,
    pub in_flight: bool,
}

impl PollState {
    pub fn new(next_run: Instant) -> Self {
        Self {
            next_run,
            consecutive_failures: 0,
            device_info: None,
            device_info_refreshed_at: None,
            driver: None,
            in_flight: false,
        }
    }
}

/// One entry of the live target registry: the immutable config snapshot
/// for a target plus its mutable scheduling state.
pub struct LiveTarget {
    pub target: Target,
    pub state: PollState,
}

/// The authoritative in-memory mapping from target name to
/// `(Target, PollState)`. Reads never observe a torn snapshot: every
/// mutation replaces or removes a single `DashMap` entry atomically.
#[derive(Default)]
pub struct LiveTargetRegistry {
    entries: DashMap<String, LiveTarget>,
}

impl LiveTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.entries
            .iter()
            .any(|e| normalize_host(&e.value().target.host) == host)
    }

    /// Insert a brand-new target with fresh poll state.
    pub fn insert_new(&self, target: Target, next_run: Instant) {
        let name = target.name.clone();
        self.entries.insert(
            name,
            LiveTarget {
                target,
                state: PollState::new(next_run),
            },
        );
    }

    /// Replace the `Target` half of an existing entry while preserving
    /// as much `PollState` as remains valid; see `ConfigWatcher::apply_diff`
    /// for the exact preservation rules.
    pub fn replace_target(&self, name: &str, mutate: impl FnOnce(&mut LiveTarget)) -> bool {
        if let Some(mut entry) = self.entries.get_mut(name) {
            mutate(&mut entry);
            true
        } else {
            false
        }
    }

    pub fn remove(&self, name: &str) -> Option<LiveTarget> {
        self.entries.remove(name).map(|(_, v)| v)
    }

    pub fn get_target_clone(&self, name: &str) -> Option<Target> {
        self.entries.get(name).map(|e| e.value().target.clone())
    }

    /// Run `f` with mutable access to a single entry's poll state.
    pub fn with_state_mut<R>(&self, name: &str, f: impl FnOnce(&Target, &mut PollState) -> R) -> Option<R> {
        self.entries
            .get_mut(name)
            .map(|mut e| {
                let LiveTarget { target, state } = &mut *e;
                f(target, state)
            })
    }

    /// Snapshot the set of targets that are due (`next_run <= now`) and not
    /// already in flight, marking them in-flight as part of the same pass
    /// so a concurrent tick never double-dispatches a target.
    pub fn take_due(&self, now: Instant) -> Vec<(String, Target)> {
        let mut due = Vec::new();
        for mut entry in self.entries.iter_mut() {
            let LiveTarget { target, state } = entry.value_mut();
            if !state.in_flight && state.next_run <= now {
                state.in_flight = true;
                due.push((target.name.clone(), target.clone()));
            }
        }
        due
    }

    /// Earliest `next_run` across all entries that are not currently in
    /// flight, used to bound the scheduler's sleep between ticks. An
    /// in-flight entry's `next_run` is stale (left in the past until the
    /// poll completes and reschedules it), so it must be excluded here —
    /// otherwise the tick loop would never sleep for as long as any poll
    /// is outstanding.
    pub fn earliest_next_run(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| !e.value().state.in_flight)
            .map(|e| e.value().state.next_run)
            .min()
    }
}
