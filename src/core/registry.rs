//! Background volume polling with change notification.
//!
//! The poll loop wakes on a short tick so it can stop quickly, but only
//! probes the system once per check interval. Subscribers hear about a new
//! snapshot only when it differs from the previous one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::Volume;
use super::probe::VolumeProbe;

/// Called with the full new snapshot whenever it changes.
pub type ChangeCallback = Arc<dyn Fn(Vec<Volume>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// How often the loop wakes to check for shutdown.
    pub tick: Duration,
    /// Minimum time between two probes.
    pub check_interval: Duration,
    /// How long `stop()` waits for the loop before aborting it.
    pub stop_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            check_interval: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

pub struct VolumeRegistry {
    probe: VolumeProbe,
    config: RegistryConfig,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    latest_tx: watch::Sender<Vec<Volume>>,
}

impl VolumeRegistry {
    pub fn new(probe: VolumeProbe, config: RegistryConfig) -> Self {
        let (latest_tx, _) = watch::channel(Vec::new());
        Self {
            probe,
            config,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            latest_tx,
        }
    }

    pub fn probe(&self) -> &VolumeProbe {
        &self.probe
    }

    /// Last snapshot the poll loop reported.
    pub fn latest(&self) -> Vec<Volume> {
        self.latest_tx.borrow().clone()
    }

    /// Watch the published snapshot without registering a callback.
    pub fn watch(&self) -> watch::Receiver<Vec<Volume>> {
        self.latest_tx.subscribe()
    }

    /// Start the poll loop. Calling it again while running is a no-op.
    pub fn start(&self, on_change: ChangeCallback) {
        let mut slot = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() || self.cancel.is_cancelled() {
            debug!("Volume registry already started");
            return;
        }

        info!(
            interval_secs = self.config.check_interval.as_secs_f64(),
            "Starting volume monitor"
        );

        *slot = Some(tokio::spawn(poll_loop(
            self.probe.clone(),
            self.config,
            self.cancel.clone(),
            self.latest_tx.clone(),
            on_change,
        )));
    }

    /// Stop the poll loop and wait for it, up to the configured timeout.
    /// No callback fires once this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.config.stop_timeout, handle).await {
            Ok(_) => debug!("Volume monitor stopped"),
            Err(_) => {
                warn!("Volume monitor did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

async fn poll_loop(
    probe: VolumeProbe,
    config: RegistryConfig,
    cancel: CancellationToken,
    latest_tx: watch::Sender<Vec<Volume>>,
    on_change: ChangeCallback,
) {
    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_snapshot: Vec<Volume> = Vec::new();
    let mut last_check: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if last_check.is_some_and(|at| at.elapsed() < config.check_interval) {
            continue;
        }
        last_check = Some(Instant::now());

        let probe = probe.clone();
        let current = match tokio::task::spawn_blocking(move || probe.list_volumes()).await {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!(error = %e, "Volume probe failed");
                continue;
            }
        };

        if current == last_snapshot {
            continue;
        }

        if cancel.is_cancelled() {
            break;
        }

        debug!(volumes = current.len(), "Volume list changed");
        last_snapshot = current.clone();
        latest_tx.send_replace(current.clone());
        on_change(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimulatedVolumeSource, Simulator};
    use crate::core::hardware::{MountedVolume, Usage, VolumeSource};
    use crate::core::probe::RemovablePolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct CountingSource {
        inner: SimulatedVolumeSource,
        lists: Arc<AtomicUsize>,
    }

    impl VolumeSource for CountingSource {
        fn list_mounted_volumes(&self) -> anyhow::Result<Vec<MountedVolume>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.inner.list_mounted_volumes()
        }

        fn usage(&self, volume: &MountedVolume) -> anyhow::Result<Usage> {
            self.inner.usage(volume)
        }
    }

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            tick: Duration::from_millis(5),
            check_interval: Duration::from_millis(30),
            stop_timeout: Duration::from_secs(1),
        }
    }

    fn registry() -> (VolumeRegistry, Simulator, Arc<AtomicUsize>) {
        let (inner, sim) = SimulatedVolumeSource::new();
        let lists = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            inner,
            lists: lists.clone(),
        };
        let probe = VolumeProbe::new(Arc::new(source), RemovablePolicy::permissive());
        (VolumeRegistry::new(probe, fast_config()), sim, lists)
    }

    fn channel_callback() -> (ChangeCallback, mpsc::UnboundedReceiver<Vec<Volume>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ChangeCallback = Arc::new(move |volumes: Vec<Volume>| {
            let _ = tx.send(volumes);
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn notifies_once_per_distinct_snapshot() {
        let (registry, sim, _) = registry();
        sim.add("/dev/sdb1", "/media/A", 8);

        let (callback, mut rx) = channel_callback();
        registry.start(callback);

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout waiting for first snapshot")
            .expect("channel closed");
        assert_eq!(first.len(), 1);
        assert_eq!(registry.latest(), first);

        // Identical probes stay silent.
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());

        sim.set_used("/media/A", 1024);
        let second = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout waiting for changed snapshot")
            .expect("channel closed");
        assert_eq!(second[0].used_bytes, 1024);

        registry.stop().await;
    }

    #[tokio::test]
    async fn empty_system_stays_silent_until_plugged() {
        let (registry, sim, _) = registry();
        let (callback, mut rx) = channel_callback();
        registry.start(callback);

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        sim.add("/dev/sdc1", "/media/B", 4);
        let snapshot = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(snapshot[0].label, "sdc1");

        registry.stop().await;
    }

    #[tokio::test]
    async fn probes_at_most_once_per_interval() {
        let (registry, _sim, lists) = registry();
        let (callback, _rx) = channel_callback();
        registry.start(callback);

        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.stop().await;

        let probes = lists.load(Ordering::SeqCst);
        assert!(probes >= 1);
        assert!(probes <= 200 / 30 + 2, "probed {} times", probes);
    }

    #[tokio::test]
    async fn no_callbacks_after_stop() {
        let (registry, sim, _) = registry();
        let (callback, mut rx) = channel_callback();
        registry.start(callback);

        timeout(Duration::from_secs(1), registry.stop())
            .await
            .expect("stop exceeded its bound");

        sim.add("/dev/sdd1", "/media/C", 4);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // Restarting a stopped registry does nothing.
        let (callback, mut rx) = channel_callback();
        registry.start(callback);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }
}
