//! Progress computation and delivery for running operations.
//!
//! `ProgressMeter` turns "units of work done" into percentage and ETA and
//! pushes the result to a `ProgressSink`. `ProgressTracker` keeps the latest
//! event per operation kind so callers can poll instead of subscribing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::RwLock;

use super::models::{OperationKind, ProgressChannel, ProgressEvent};

/// Receives progress events, serially and in non-decreasing percent order.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Estimated seconds remaining: `elapsed * (100 - percent) / percent`, 0 when
/// nothing has been done yet.
pub fn eta_secs(elapsed_secs: f64, percent: f64) -> f64 {
    if percent <= 0.0 {
        return 0.0;
    }
    (elapsed_secs * (100.0 - percent) / percent).max(0.0)
}

/// Tracks completed units against a fixed total for one operation.
pub struct ProgressMeter {
    sink: Arc<dyn ProgressSink>,
    channel: ProgressChannel,
    total_units: u64,
    done_units: u64,
    last_percent: f64,
    started: Instant,
}

impl ProgressMeter {
    pub fn new(sink: Arc<dyn ProgressSink>, channel: ProgressChannel, total_units: u64) -> Self {
        Self {
            sink,
            channel,
            total_units,
            done_units: 0,
            last_percent: 0.0,
            started: Instant::now(),
        }
    }

    pub fn done_units(&self) -> u64 {
        self.done_units
    }

    pub fn percent(&self) -> f64 {
        self.last_percent
    }

    /// Record `units` more work and report the new position.
    pub fn advance(&mut self, units: u64, message: impl Into<String>) {
        self.done_units = self.done_units.saturating_add(units);
        let raw = if self.total_units == 0 {
            100.0
        } else {
            self.done_units as f64 / self.total_units as f64 * 100.0
        };
        self.emit(raw, message.into());
    }

    /// Report a status line without moving the position.
    pub fn status(&mut self, message: impl Into<String>) {
        self.emit(self.last_percent, message.into());
    }

    /// Report completion at 100% with no time remaining.
    pub fn finish(&mut self, message: impl Into<String>) {
        self.last_percent = 100.0;
        self.sink.report(ProgressEvent {
            percent: 100.0,
            message: message.into(),
            eta_secs: 0.0,
            channel: self.channel,
        });
    }

    fn emit(&mut self, raw_percent: f64, message: String) {
        let percent = raw_percent.clamp(0.0, 100.0).max(self.last_percent);
        self.last_percent = percent;

        let eta = if percent >= 100.0 {
            0.0
        } else {
            eta_secs(self.started.elapsed().as_secs_f64(), percent)
        };

        self.sink.report(ProgressEvent {
            percent,
            message,
            eta_secs: eta,
            channel: self.channel,
        });
    }
}

/// A `ProgressMeter` that can be moved into per-file callbacks running on a
/// blocking worker while the owning engine keeps reporting around them.
#[derive(Clone)]
pub struct SharedMeter(Arc<Mutex<ProgressMeter>>);

impl SharedMeter {
    pub fn new(sink: Arc<dyn ProgressSink>, channel: ProgressChannel, total_units: u64) -> Self {
        Self(Arc::new(Mutex::new(ProgressMeter::new(
            sink,
            channel,
            total_units,
        ))))
    }

    fn lock(&self) -> MutexGuard<'_, ProgressMeter> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, units: u64, message: impl Into<String>) {
        self.lock().advance(units, message);
    }

    pub fn status(&self, message: impl Into<String>) {
        self.lock().status(message);
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.lock().finish(message);
    }

    pub fn percent(&self) -> f64 {
        self.lock().percent()
    }
}

/// Thread-safe store of the latest progress event per operation kind.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<OperationKind, ProgressEvent>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, kind: OperationKind, event: ProgressEvent) {
        let mut map = self.inner.write().await;
        map.insert(kind, event);
    }

    pub async fn get(&self, kind: OperationKind) -> Option<ProgressEvent> {
        let map = self.inner.read().await;
        map.get(&kind).cloned()
    }

    pub async fn remove(&self, kind: OperationKind) {
        let mut map = self.inner.write().await;
        map.remove(&kind);
    }
}
