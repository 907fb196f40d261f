//! Subscriber setup and log rate limiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    fn default_directive(&self) -> &'static str {
        if self.verbose {
            "usbsync=debug"
        } else {
            "usbsync=info"
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Lets one caller through per interval; the rest are told to stay quiet.
/// Safe to share between the copy worker and anything else logging progress.
pub struct LogThrottle {
    interval_ms: u64,
    epoch: Instant,
    /// Milliseconds since `epoch` before which nothing is logged.
    next_due_ms: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            epoch: Instant::now(),
            next_due_ms: AtomicU64::new(0),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.epoch.elapsed().as_millis() as u64;
        let due = self.next_due_ms.load(Ordering::Relaxed);
        if now < due {
            return false;
        }

        self.next_due_ms
            .compare_exchange(
                due,
                now.saturating_add(self.interval_ms),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_lets_first_call_through_then_holds() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reopens_after_interval() {
        let throttle = LogThrottle::new(Duration::from_millis(10));
        assert!(throttle.should_log());
        std::thread::sleep(Duration::from_millis(20));
        assert!(throttle.should_log());
    }

    #[test]
    fn verbose_config_selects_debug_filter() {
        let config = AppConfig {
            verbose: true,
            json_logs: true,
            ..Default::default()
        };
        let log = LogConfig::from(&config);
        assert!(log.json);
        assert_eq!(log.default_directive(), "usbsync=debug");
        assert_eq!(LogConfig::default().default_directive(), "usbsync=info");
    }
}
