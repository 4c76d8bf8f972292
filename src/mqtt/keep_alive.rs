//! Venus keep-alive scheduling and the "data updates have stopped" watchdog.
//!
//! Venus only publishes `N/...` telemetry while someone keeps asking for
//! it with `R/<installation>/keepalive`. In periodic mode every tick
//! publishes a request. Otherwise another system is assumed to send them
//! and a request is only sent once per grace period of telemetry silence.

use super::config::KeepAliveConfig;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepAliveReason {
    Periodic,
    /// Nothing arrived within the grace period.
    TelemetrySilent,
    /// Fresh connection or newly discovered installation.
    Initial,
}

#[derive(Debug)]
pub struct KeepAliveScheduler {
    periodic: bool,
    interval: Duration,
    grace_period: Duration,
    watchdog: Duration,
    started: Instant,
    last_request: Option<Instant>,
    data_stopped: bool,
}

impl KeepAliveScheduler {
    pub fn new(config: &KeepAliveConfig, now: Instant) -> Self {
        Self {
            periodic: config.periodic,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            grace_period: Duration::from_millis(config.grace_period_ms),
            watchdog: Duration::from_millis(config.watchdog_ms),
            started: now,
            last_request: None,
            data_stopped: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Decides whether this interval tick should publish a request.
    ///
    /// A failed publish is simply not recorded, so the next tick asks again.
    pub fn on_tick(
        &self,
        now: Instant,
        last_telemetry: Option<Instant>,
    ) -> Option<KeepAliveReason> {
        if self.periodic {
            return Some(KeepAliveReason::Periodic);
        }

        let reference = [Some(self.started), last_telemetry, self.last_request]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.started);
        if now.saturating_duration_since(reference) >= self.grace_period {
            debug!(
                "No telemetry for {:?}, requesting keep-alive",
                now.saturating_duration_since(last_telemetry.unwrap_or(self.started))
            );
            Some(KeepAliveReason::TelemetrySilent)
        } else {
            None
        }
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_request = Some(now);
    }

    pub fn last_request(&self) -> Option<Instant> {
        self.last_request
    }

    /// Updates the watchdog. `since` is the last telemetry receipt, or the
    /// connection time when nothing arrived yet. Returns true while
    /// updates are considered stopped.
    pub fn check_watchdog(
        &mut self,
        now: Instant,
        since: Option<Instant>,
        connected: bool,
    ) -> bool {
        let stopped = connected
            && since.is_some_and(|since| now.saturating_duration_since(since) > self.watchdog);

        if stopped && !self.data_stopped {
            warn!(
                "Data updates have stopped (nothing for over {:?})",
                self.watchdog
            );
        } else if !stopped && self.data_stopped {
            info!("Data updates resumed");
        }
        self.data_stopped = stopped;
        stopped
    }

    pub fn data_stopped(&self) -> bool {
        self.data_stopped
    }
}
