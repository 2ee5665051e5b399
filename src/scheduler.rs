//! The supervisor task that owns the Live Target Registry: selects due
//! targets, dispatches polls under a global concurrency bound, applies
//! backoff to failing targets, and refreshes/evicts cached Device Info.
//!
//! Mirrors the tick-and-dispatch shape of `neomind-devices`'s
//! `HttpAdapter::polling_loop`, generalized from one fixed adapter's device
//! list to a shared scheduler over a dynamically mutated target set.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};

use crate::client::{ClientError, DeviceClient};
use crate::driver::{DriverId, DriverRegistry};
use crate::metrics::MetricRegistry;
use crate::model::{ChannelReading, DeviceInfo, DeviceReading, LiveTargetRegistry, Target};

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no driver matched this device")]
    UnknownDevice,
}

impl PollError {
    pub fn kind_tag(&self) -> &'static str {
        match self {
            PollError::Client(err) => err.kind_tag(),
            PollError::UnknownDevice => "unknown_device",
        }
    }
}

/// After this many consecutive failures the cached Device Info (and with
/// it the driver binding) is discarded, forcing re-identification.
const DRIVER_CACHE_INVALIDATION_THRESHOLD: u32 = 3;

const TICK_UPPER_BOUND: Duration = Duration::from_secs(1);

pub struct Scheduler {
    registry: Arc<LiveTargetRegistry>,
    client: DeviceClient,
    drivers: Arc<DriverRegistry>,
    metrics: Arc<MetricRegistry>,
    semaphore: RwLock<Arc<Semaphore>>,
    device_info_refresh: Duration,
    request_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Scheduler {
    pub fn new(
        registry: Arc<LiveTargetRegistry>,
        client: DeviceClient,
        drivers: Arc<DriverRegistry>,
        metrics: Arc<MetricRegistry>,
        max_concurrency: usize,
        device_info_refresh: Duration,
        request_timeout: Duration,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            drivers,
            metrics,
            semaphore: RwLock::new(Arc::new(Semaphore::new(max_concurrency))),
            device_info_refresh,
            request_timeout,
            backoff_base,
            backoff_max,
        }
    }

    /// Live-resize the concurrency bound. In-flight polls keep holding
    /// permits from the previous semaphore until they complete; the old
    /// semaphore is simply dropped once empty.
    pub async fn resize_concurrency(&self, max_concurrency: usize) {
        let mut guard = self.semaphore.write().await;
        *guard = Arc::new(Semaphore::new(max_concurrency));
    }

    /// Jittered initial `next_run` for a freshly registered target:
    /// `now + uniform(0, interval)`.
    pub fn initial_next_run(interval: Duration) -> Instant {
        let jitter_ms = rand::thread_rng().gen_range(0..=interval.as_millis().max(1) as u64);
        Instant::now() + Duration::from_millis(jitter_ms)
    }

    /// Run the tick loop forever. Intended to run inside a dedicated
    /// `tokio::spawn`; `shutdown` resolves when the process is asked to stop.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let now = Instant::now();
            let due = self.registry.take_due(now);
            for (name, target) in due {
                let scheduler = Arc::clone(&self);
                tokio::spawn(async move {
                    scheduler.poll_one(&name, target).await;
                });
            }

            let sleep_for = self
                .registry
                .earliest_next_run()
                .map(|next| next.saturating_duration_since(Instant::now()))
                .unwrap_or(TICK_UPPER_BOUND)
                .min(TICK_UPPER_BOUND);

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

    async fn poll_one(&self, name: &str, target: Target) {
        let permit = self.semaphore.read().await.clone().acquire_owned().await;
        let Ok(_permit) = permit else {
            // Semaphore was closed (shutdown); nothing to do.
            self.clear_in_flight(name);
            return;
        };

        let started = Instant::now();
        let outcome = self.execute_poll(name, &target).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(reading) => self.on_success(name, reading),
            Err(err) => self.on_failure(name, &target, &err),
        }

        tracing::debug!(target = name, host = %target.host, elapsed_ms = elapsed.as_millis(), "poll complete");
    }

    async fn execute_poll(&self, name: &str, target: &Target) -> Result<DeviceReading, PollError> {
        let driver_id = self.ensure_device_info(name, target).await?;
        let driver = self
            .drivers
            .by_id(driver_id)
            .ok_or(PollError::UnknownDevice)?;

        let started = Instant::now();
        let status = self
            .client
            .call(&target.host, "Shelly.GetStatus", &target.credentials, self.request_timeout)
            .await?;
        let elapsed = started.elapsed();

        let parsed = driver.parse(&status, target);
        Ok(DeviceReading {
            up: true,
            poll_duration: elapsed,
            channels: parsed.channels,
            system: parsed.system,
            input_states: parsed.input_states,
        })
    }

    /// Ensures a driver binding exists for this target, refreshing or
    /// (re)acquiring Device Info as needed, and returns the bound driver id.
    async fn ensure_device_info(&self, name: &str, target: &Target) -> Result<DriverId, PollError> {
        let needs_refresh = self
            .registry
            .with_state_mut(name, |_, state| {
                state.device_info.is_none()
                    || state
                        .device_info_refreshed_at
                        .map(|at| at.elapsed() >= self.device_info_refresh)
                        .unwrap_or(true)
            })
            .unwrap_or(true);

        if needs_refresh {
            match self
                .client
                .call(&target.host, "Shelly.GetDeviceInfo", &target.credentials, self.request_timeout)
                .await
            {
                Ok(value) => {
                    if let Some(info) = parse_device_info(&value) {
                        let driver_id = self.drivers.select(&info).map(|d| d.id());
                        if let Some(id) = driver_id {
                            if let Some(driver) = self.drivers.by_id(id) {
                                warn_unsupported_channels(name, target, &info, driver);
                            }
                        }
                        self.registry.with_state_mut(name, |_, state| {
                            state.device_info = Some(info);
                            state.device_info_refreshed_at = Some(Instant::now());
                            state.driver = driver_id;
                        });
                    }
                }
                Err(_) => {
                    // Identification failed; fall through to whatever is cached.
                }
            }
        }

        self.registry
            .with_state_mut(name, |_, state| state.driver)
            .flatten()
            .ok_or(PollError::UnknownDevice)
    }

    fn on_success(&self, name: &str, reading: DeviceReading) {
        self.metrics.record_success(name, &reading);

        if let Some(target) = self.registry.get_target_clone(name) {
            for channel_spec in &target.channels {
                if let Some(reading) = find_channel(&reading.channels, channel_spec.kind, channel_spec.index) {
                    self.metrics.record_channel(name, reading, &channel_spec.ignore);
                }
            }
        }

        self.registry.with_state_mut(name, |target, state| {
            state.consecutive_failures = 0;
            state.next_run = Instant::now() + target.poll_interval;
            state.in_flight = false;
        });
    }

    fn on_failure(&self, name: &str, target: &Target, err: &PollError) {
        self.metrics.record_failure(name);

        self.registry.with_state_mut(name, |_, state| {
            state.consecutive_failures += 1;
            let delay = backoff_delay(state.consecutive_failures, self.backoff_base, self.backoff_max);
            state.next_run = Instant::now() + delay;
            state.in_flight = false;

            if state.consecutive_failures >= DRIVER_CACHE_INVALIDATION_THRESHOLD {
                state.device_info = None;
                state.driver = None;
                state.device_info_refreshed_at = None;
            }
        });

        tracing::warn!(target = name, host = %target.host, error = %err, kind = err.kind_tag(), "poll failed");
    }

    fn clear_in_flight(&self, name: &str) {
        self.registry.with_state_mut(name, |_, state| {
            state.in_flight = false;
        });
    }
}

fn find_channel(
    channels: &[ChannelReading],
    kind: crate::model::ChannelKind,
    index: u32,
) -> Option<&ChannelReading> {
    channels.iter().find(|c| c.kind == kind && c.index == index)
}

/// Warn (once per binding) about any configured channel whose index falls
/// outside the bound driver's supported set for its kind; such channels are
/// dropped implicitly since the driver's own `parse` never reports them.
fn warn_unsupported_channels(name: &str, target: &Target, info: &DeviceInfo, driver: &dyn crate::driver::Driver) {
    let supported = driver.supported_channels(info);
    for spec in &target.channels {
        let in_range = supported.get(&spec.kind).map(|set| set.contains(&spec.index)).unwrap_or(false);
        if !in_range {
            tracing::warn!(
                target = name,
                driver = driver.name(),
                kind = spec.kind.as_str(),
                index = spec.index,
                "channel index not supported by bound driver; dropped"
            );
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

/// `min(backoff_max, backoff_base * 2^(n-1))` plus a small jitter, per the
/// backoff-monotonicity invariant.
fn backoff_delay(consecutive_failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(20);
    let scaled = base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    let capped = scaled.min(max);
    let jitter_ms = rand::thread_rng().gen_range(0..=(capped.as_millis() as u64 / 10).max(1));
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps_at_max() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        let d1 = backoff_delay(1, base, max);
        let d2 = backoff_delay(2, base, max);
        let d3 = backoff_delay(3, base, max);
        let d10 = backoff_delay(10, base, max);

        assert!(d1 >= base && d1 < base + Duration::from_secs(4));
        assert!(d2 >= base * 2 && d2 < base * 2 + Duration::from_secs(7));
        assert!(d3 >= base * 4 && d3 < base * 4 + Duration::from_secs(13));
        assert!(d10 >= max && d10 < max + Duration::from_secs(31));
    }

    #[test]
    fn initial_next_run_is_within_jitter_window() {
        let interval = Duration::from_secs(10);
        let before = Instant::now();
        let next_run = Scheduler::initial_next_run(interval);
        assert!(next_run >= before);
        assert!(next_run <= before + interval + Duration::from_millis(50));
    }
}
