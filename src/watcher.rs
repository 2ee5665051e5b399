//! Debounced config-file watcher. Detects changes, loads + validates a new
//! snapshot, diffs it against the current one, and applies the diff
//! atomically to the Live Target Registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::{self, ConfigSnapshot};
use crate::discovery::NetworkScanner;
use crate::metrics::MetricRegistry;
use crate::model::LiveTargetRegistry;
use crate::scheduler::Scheduler;

const DEBOUNCE: Duration = Duration::from_secs(1);

pub struct ConfigWatcher {
    path: PathBuf,
    registry: Arc<LiveTargetRegistry>,
    metrics: Arc<MetricRegistry>,
    scheduler: Arc<Scheduler>,
    scanner: Option<Arc<NetworkScanner>>,
    current: tokio::sync::Mutex<ConfigSnapshot>,
}

impl ConfigWatcher {
    pub fn new(
        path: PathBuf,
        initial: ConfigSnapshot,
        registry: Arc<LiveTargetRegistry>,
        metrics: Arc<MetricRegistry>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            path,
            registry,
            metrics,
            scheduler,
            scanner: None,
            current: tokio::sync::Mutex::new(initial),
        }
    }

    /// Attach the network scanner so discovery settings are pushed to it
    /// live on reload. Optional: tests construct a watcher without one.
    pub fn with_scanner(mut self, scanner: Arc<NetworkScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Run the watch loop until `shutdown` fires. Bridges `notify`'s
    /// synchronous callback into async-land via an unbounded channel, the
    /// same pattern used for blocking-to-async bridges throughout the
    /// corpus's file- and device-watching code.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watch_path = self.path.clone();

        let mut watcher = match notify::recommended_watcher(move |res: notify::Result<Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        }) {
            Ok(w) => w,
            Err(err) => {
                tracing::error!(error = %err, "failed to construct config file watcher; hot-reload disabled");
                return;
            }
        };

        if let Err(err) = watcher.watch(&watch_path, RecursiveMode::NonRecursive) {
            tracing::error!(error = %err, path = %watch_path.display(), "failed to watch config file; hot-reload disabled");
            return;
        }

        let mut last_event: Option<Instant> = None;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    if maybe.is_none() {
                        return;
                    }
                    last_event = Some(Instant::now());
                    // Drain any further coalesced events within the debounce window.
                    tokio::time::sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}
                    if last_event.map(|t| t.elapsed() >= DEBOUNCE).unwrap_or(false) {
                        self.reload().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn reload(&self) {
        let new_snapshot = match config::load_from_path(&self.path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(error = %err, "config reload failed validation; retaining previous snapshot");
                self.metrics.record_reload(false);
                return;
            }
        };

        let mut current = self.current.lock().await;
        self.apply_diff(&current, &new_snapshot).await;
        *current = new_snapshot;
        self.metrics.record_reload(true);
        tracing::info!("config reload applied");
    }

    async fn apply_diff(&self, old: &ConfigSnapshot, new: &ConfigSnapshot) {
        let old_names: std::collections::HashMap<_, _> =
            old.targets.iter().map(|t| (t.name.clone(), t)).collect();
        let new_names: std::collections::HashSet<_> = new.targets.iter().map(|t| t.name.clone()).collect();

        for (name, old_target) in &old_names {
            if !new_names.contains(name) {
                self.registry.remove(name);
                self.metrics.remove_device(name);
                tracing::info!(target = name, "target removed by config reload");
            }
            let _ = old_target;
        }

        for target in &new.targets {
            match old_names.get(&target.name) {
                None => {
                    let next_run = Scheduler::initial_next_run(target.poll_interval);
                    self.registry.insert_new(target.clone(), next_run);
                    tracing::info!(target = %target.name, host = %target.host, "target added by config reload");
                }
                Some(old_target) => {
                    let unchanged_identity = old_target.host == target.host && old_target.credentials == target.credentials;
                    let interval_changed = old_target.poll_interval != target.poll_interval;
                    let new_target = target.clone();
                    self.registry.replace_target(&target.name, |live| {
                        if !unchanged_identity {
                            live.state.device_info = None;
                            live.state.driver = None;
                            live.state.device_info_refreshed_at = None;
                        }
                        if interval_changed {
                            live.state.next_run = Instant::now() + new_target.poll_interval;
                        }
                        live.target = new_target;
                    });
                }
            }
        }

        if old.global.max_concurrency != new.global.max_concurrency {
            self.scheduler.resize_concurrency(new.global.max_concurrency).await;
        }
        if let Some(scanner) = &self.scanner {
            if old.discovery != new.discovery {
                scanner.update_settings(new.discovery.clone()).await;
            }
            if old.global.poll_interval != new.global.poll_interval {
                scanner.update_default_poll_interval(new.global.poll_interval).await;
            }
        }
        if old.global.listen_host != new.global.listen_host || old.global.listen_port != new.global.listen_port {
            tracing::warn!(
                old_host = %old.global.listen_host,
                old_port = old.global.listen_port,
                new_host = %new.global.listen_host,
                new_port = new.global.listen_port,
                "listen address changed in config; restart required to take effect"
            );
        }
    }
}

pub fn parent_dir_for_watch(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeviceClient;
    use crate::driver::DriverRegistry;
    use crate::model::{ChannelKind, ChannelSpec, Credentials, Target};

    fn target(name: &str, host: &str) -> Target {
        Target {
            name: name.to_string(),
            host: host.to_string(),
            poll_interval: Duration::from_secs(10),
            credentials: Credentials::default(),
            channels: vec![ChannelSpec {
                kind: ChannelKind::Switch,
                index: 0,
                ignore: Default::default(),
            }],
        }
    }

    fn empty_snapshot(targets: Vec<Target>) -> ConfigSnapshot {
        ConfigSnapshot {
            global: config::GlobalSettings {
                log_level: "INFO".into(),
                listen_host: "0.0.0.0".into(),
                listen_port: 10037,
                poll_interval: Duration::from_secs(10),
                request_timeout: Duration::from_secs(3),
                max_concurrency: 50,
                device_info_refresh: Duration::from_secs(21600),
                backoff_base: Duration::from_secs(30),
                backoff_max: Duration::from_secs(300),
            },
            targets,
            discovery: config::DiscoverySettings {
                enabled: false,
                scan_interval: Duration::from_secs(300),
                network_ranges: vec![],
                scan_timeout: Duration::from_secs(1),
                scan_concurrency: 16,
                auto_add_discovered: true,
                auto_add_credentials: None,
                exclude_ips: vec![],
                name_template: "{model}-{ip}".into(),
                persist_path: None,
            },
        }
    }

    #[tokio::test]
    async fn apply_diff_adds_and_removes_targets() {
        let registry = Arc::new(LiveTargetRegistry::new());
        let metrics = Arc::new(MetricRegistry::new());
        let drivers = Arc::new(DriverRegistry::with_builtin_drivers());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&registry),
            DeviceClient::new(),
            drivers,
            Arc::clone(&metrics),
            50,
            Duration::from_secs(21600),
            Duration::from_secs(3),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));

        let old = empty_snapshot(vec![target("a", "10.0.0.1")]);
        registry.insert_new(target("a", "10.0.0.1"), Instant::now());

        let watcher = ConfigWatcher::new(
            PathBuf::from("/dev/null"),
            old.clone(),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            scheduler,
        );

        let new = empty_snapshot(vec![target("c", "10.0.0.3")]);
        watcher.apply_diff(&old, &new).await;

        assert!(registry.get_target_clone("a").is_none());
        assert!(registry.get_target_clone("c").is_some());
    }
}
