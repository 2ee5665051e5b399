//! Network scanner: expands configured address ranges, probes each host
//! for a Shelly identity, and splices positive identifications into the
//! Live Target Registry.
//!
//! Address-range expansion is grounded in `neomind-devices::discovery`'s
//! `DeviceDiscovery::parse_ip_range` (CIDR + dash-range + single-IP
//! parsing via plain `u32` arithmetic, no extra crate), extended here to
//! accept a fully dotted `A.B.C.D-E.F.G.H` range rather than
//! only a last-octet shorthand. Concurrent probing mirrors that module's
//! `scan_ports`'s `buffer_unordered` pattern, swapped for a semaphore so
//! the concurrency bound is an explicit, user-configured number rather
//! than a hardcoded fan-out.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};

use crate::client::DeviceClient;
use crate::config::DiscoverySettings;
use crate::driver::DriverRegistry;
use crate::metrics::MetricRegistry;
use crate::model::{ChannelSpec, Credentials, DeviceInfo, DiscoveredDevice, LiveTargetRegistry, Target};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid network range {0:?}")]
    InvalidRange(String),
}

/// One row of the persisted discovery file (`discovery.persist_path`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDevice {
    ip: String,
    model: String,
    gen: i64,
    app: String,
    mac: String,
    discovered_at: chrono::DateTime<chrono::Utc>,
}

impl From<&DiscoveredDevice> for PersistedDevice {
    fn from(d: &DiscoveredDevice) -> Self {
        PersistedDevice {
            ip: d.address.clone(),
            model: d.info.model.clone(),
            gen: d.info.gen,
            app: d.info.app.clone(),
            mac: d.info.mac.clone(),
            discovered_at: d.discovered_at,
        }
    }
}

/// Expand every entry of `ranges` into concrete addresses, minus `exclude`.
/// Accepts CIDR (`A.B.C.D/N`), an inclusive dotted range (`A.B.C.D-E.F.G.H`),
/// and a bare single address.
pub fn expand_ranges(ranges: &[String], exclude: &[String]) -> Result<Vec<IpAddr>, DiscoveryError> {
    let excluded: HashSet<IpAddr> = exclude.iter().filter_map(|s| s.trim().parse().ok()).collect();

    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    for range in ranges {
        for addr in expand_one(range.trim())? {
            if excluded.contains(&addr) {
                continue;
            }
            if seen.insert(addr) {
                addrs.push(addr);
            }
        }
    }
    Ok(addrs)
}

fn expand_one(range: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
    if let Some((base, prefix)) = range.split_once('/') {
        let base: Ipv4Addr = base.parse().map_err(|_| DiscoveryError::InvalidRange(range.to_string()))?;
        let prefix: u32 = prefix.parse().map_err(|_| DiscoveryError::InvalidRange(range.to_string()))?;
        if prefix > 32 {
            return Err(DiscoveryError::InvalidRange(range.to_string()));
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = u32::from(base) & mask;
        let host_bits = 32 - prefix;
        let count = 1u64 << host_bits;
        let addrs = (0..count).map(|i| IpAddr::V4(Ipv4Addr::from(network.wrapping_add(i as u32)))).collect();
        return Ok(addrs);
    }

    if let Some((start, end)) = range.split_once('-') {
        let start: Ipv4Addr = start.parse().map_err(|_| DiscoveryError::InvalidRange(range.to_string()))?;
        // The trailing side may be a full dotted address or (for
        // compatibility with the common shorthand) a bare last octet.
        let end: Ipv4Addr = if end.contains('.') {
            end.parse().map_err(|_| DiscoveryError::InvalidRange(range.to_string()))?
        } else {
            let last: u8 = end.parse().map_err(|_| DiscoveryError::InvalidRange(range.to_string()))?;
            let mut octets = start.octets();
            octets[3] = last;
            Ipv4Addr::from(octets)
        };
        let start_u32 = u32::from(start);
        let end_u32 = u32::from(end);
        if end_u32 < start_u32 {
            return Err(DiscoveryError::InvalidRange(range.to_string()));
        }
        return Ok((start_u32..=end_u32).map(|i| IpAddr::V4(Ipv4Addr::from(i))).collect());
    }

    let addr: IpAddr = range.parse().map_err(|_| DiscoveryError::InvalidRange(range.to_string()))?;
    Ok(vec![addr])
}

/// Render a `name_template` (`{ip} {model} {gen} {app} {mac} {id}`) safely,
/// substituting an empty string for any placeholder the device didn't
/// supply rather than failing.
fn render_name_template(template: &str, ip: &str, info: &DeviceInfo, id: u64) -> String {
    template
        .replace("{ip}", ip)
        .replace("{model}", &info.model)
        .replace("{gen}", &info.gen.to_string())
        .replace("{app}", &info.app)
        .replace("{mac}", &info.mac)
        .replace("{id}", &id.to_string())
}

/// Periodic LAN scanner. Disabled unless `discovery.enabled` is set; a
/// disabled scanner still runs its loop so that a hot-reloaded
/// `enabled: true` is picked up without a restart.
pub struct NetworkScanner {
    client: DeviceClient,
    drivers: Arc<DriverRegistry>,
    metrics: Arc<MetricRegistry>,
    registry: Arc<LiveTargetRegistry>,
    settings: RwLock<DiscoverySettings>,
    default_poll_interval: RwLock<Duration>,
    next_id: AtomicU64,
}

impl NetworkScanner {
    pub fn new(
        client: DeviceClient,
        drivers: Arc<DriverRegistry>,
        metrics: Arc<MetricRegistry>,
        registry: Arc<LiveTargetRegistry>,
        settings: DiscoverySettings,
        default_poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            drivers,
            metrics,
            registry,
            settings: RwLock::new(settings),
            default_poll_interval: RwLock::new(default_poll_interval),
            next_id: AtomicU64::new(1),
        }
    }

    /// Apply a hot-reloaded discovery configuration. Takes effect on the
    /// scanner's next loop iteration.
    pub async fn update_settings(&self, settings: DiscoverySettings) {
        *self.settings.write().await = settings;
    }

    /// Apply a hot-reloaded global poll interval, used for any target the
    /// scanner auto-adds from here on.
    pub async fn update_default_poll_interval(&self, interval: Duration) {
        *self.default_poll_interval.write().await = interval;
    }

    /// Load previously persisted discoveries and splice them into the live
    /// target set before the first scan completes.
    pub async fn rehydrate(&self) {
        let persist_path = { self.settings.read().await.persist_path.clone() };
        let Some(path) = persist_path else { return };
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "failed to read discovery persist file");
                return;
            }
        };
        let persisted: Vec<PersistedDevice> = match serde_yaml::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "failed to parse discovery persist file");
                return;
            }
        };

        let settings = self.settings.read().await.clone();
        for device in persisted {
            let info = DeviceInfo {
                model: device.model,
                gen: device.gen,
                app: device.app,
                mac: device.mac,
            };
            self.maybe_add_target(&device.ip, &info, device.discovered_at, &settings).await;
        }
        tracing::info!(path = %path, "rehydrated discovered targets from persisted state");
    }

    /// Run the scan loop forever, honoring `enabled` and `scan_interval_seconds`
    /// from the live settings on every iteration.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        self.rehydrate().await;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let (enabled, interval) = {
                let settings = self.settings.read().await;
                (settings.enabled, settings.scan_interval)
            };

            if enabled {
                self.scan_once().await;
            }

            let sleep_for = if enabled { interval } else { Duration::from_secs(5) };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn scan_once(&self) {
        let settings = self.settings.read().await.clone();
        let addrs = match expand_ranges(&settings.network_ranges, &settings.exclude_ips) {
            Ok(addrs) => addrs,
            Err(err) => {
                tracing::warn!(error = %err, "discovery scan skipped: invalid network_ranges");
                return;
            }
        };

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(settings.scan_concurrency.max(1)));
        let mut probe_errors = 0u64;
        let mut discovered = Vec::new();

        let mut tasks = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            let timeout = settings.scan_timeout;
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let host = addr.to_string();
                let result = client
                    .call(&host, "Shelly.GetDeviceInfo", &Credentials::default(), timeout)
                    .await;
                match result {
                    Ok(value) => parse_device_info(&value).map(|info| (host, info)),
                    Err(err) => {
                        tracing::debug!(host = %host, error = %err, "discovery probe failed");
                        None
                    }
                }
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Some((host, info))) => discovered.push((host, info)),
                Ok(None) => probe_errors += 1,
                Err(_) => probe_errors += 1,
            }
        }

        let now = chrono::Utc::now();
        let mut devices = Vec::with_capacity(discovered.len());
        for (host, info) in discovered {
            let derived_name = self.maybe_add_target(&host, &info, now, &settings).await;
            devices.push(DiscoveredDevice {
                address: host,
                info,
                discovered_at: now,
                derived_name,
            });
        }

        self.metrics.record_discovery_scan(started.elapsed().as_secs_f64(), probe_errors);

        if let Some(path) = &settings.persist_path {
            self.persist(path, &devices).await;
        }
    }

    /// Build and insert a `Target` for a positive identification, unless a
    /// live target with this address already exists (idempotent by address)
    /// or `auto_add_discovered` is false.
    async fn maybe_add_target(
        &self,
        host: &str,
        info: &DeviceInfo,
        discovered_at: chrono::DateTime<chrono::Utc>,
        settings: &DiscoverySettings,
    ) -> String {
        let derived_name = render_name_template(&settings.name_template, host, info, self.next_id.fetch_add(1, Ordering::Relaxed));
        self.metrics.record_discovered_device(
            host,
            &info.model,
            info.gen,
            &info.app,
            &info.mac,
            &discovered_at.to_rfc3339(),
        );

        if !settings.auto_add_discovered || self.registry.contains_host(host) {
            return derived_name;
        }

        let Some(driver) = self.drivers.select(info) else {
            tracing::debug!(host, model = %info.model, "discovered device matched no driver; not added");
            return derived_name;
        };

        let credentials = settings.auto_add_credentials.clone().unwrap_or_default();
        let channels = driver
            .supported_channels(info)
            .into_iter()
            .flat_map(|(kind, indices)| {
                indices.into_iter().map(move |index| ChannelSpec {
                    kind,
                    index,
                    ignore: Default::default(),
                })
            })
            .collect();

        let target = Target {
            name: derived_name.clone(),
            host: host.to_string(),
            poll_interval: *self.default_poll_interval.read().await,
            credentials,
            channels,
        };

        let next_run = crate::scheduler::Scheduler::initial_next_run(target.poll_interval);
        self.registry.insert_new(target, next_run);
        tracing::info!(host, name = %derived_name, model = %info.model, "auto-added discovered target");
        derived_name
    }

    /// Write-temp-then-rename so a crash mid-write never corrupts the
    /// previous good persisted state.
    async fn persist(&self, path: &str, devices: &[DiscoveredDevice]) {
        let rows: Vec<PersistedDevice> = devices.iter().map(PersistedDevice::from).collect();
        let yaml = match serde_yaml::to_string(&rows) {
            Ok(yaml) => yaml,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize discovery persist file");
                return;
            }
        };

        let path = PathBuf::from(path);
        let tmp_path = path.with_extension("tmp");
        if let Err(err) = tokio::fs::write(&tmp_path, yaml).await {
            tracing::warn!(path = %tmp_path.display(), error = %err, "failed to write discovery persist tmp file");
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            tracing::warn!(path = %path.display(), error = %err, "failed to rename discovery persist tmp file into place");
        }
    }
}

fn parse_device_info(value: &serde_json::Value) -> Option<DeviceInfo> {
    Some(DeviceInfo {
        model: value.get("model")?.as_str()?.to_string(),
        gen: value.get("gen")?.as_i64()?,
        app: value.get("app")?.as_str()?.to_string(),
        mac: value.get("mac").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_cidr_produces_full_block() {
        let addrs = expand_ranges(&["192.168.1.0/30".to_string()], &[]).unwrap();
        assert_eq!(addrs.len(), 4);
    }

    #[test]
    fn expand_dotted_range_is_inclusive() {
        let addrs = expand_ranges(&["10.0.0.1-10.0.0.3".to_string()], &[]).unwrap();
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs[0], "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[2], "10.0.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn expand_single_address() {
        let addrs = expand_ranges(&["10.0.0.5".to_string()], &[]).unwrap();
        assert_eq!(addrs, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn exclude_ips_are_subtracted() {
        let addrs = expand_ranges(&["10.0.0.1-10.0.0.3".to_string()], &["10.0.0.2".to_string()]).unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(!addrs.contains(&"10.0.0.2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn rejects_invalid_range() {
        assert!(expand_ranges(&["not-an-ip".to_string()], &[]).is_err());
    }

    #[test]
    fn name_template_substitutes_all_placeholders() {
        let info = DeviceInfo {
            model: "SPSW-104PE16EU".into(),
            gen: 2,
            app: "Pro4PM".into(),
            mac: "AABBCC".into(),
        };
        let name = render_name_template("{model}-{ip}-{id}", "10.0.0.9", &info, 7);
        assert_eq!(name, "SPSW-104PE16EU-10.0.0.9-7");
    }

    #[test]
    fn name_template_tolerates_missing_fields() {
        let info = DeviceInfo {
            model: String::new(),
            gen: 0,
            app: String::new(),
            mac: String::new(),
        };
        let name = render_name_template("{ip} {model} {gen} {app} {mac}", "10.0.0.9", &info, 1);
        assert_eq!(name, "10.0.0.9   0 ");
    }
}
