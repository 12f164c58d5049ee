//! Round-trip smoothing and delay-surge detection.

use std::time::Instant;

use crate::constants::{DELAY_SURGE_WINDOW, HEALTH_WINDOW, LARGE_DELAY_MS};

/// Published delay value meaning "unknown".
pub const UNKNOWN_DELAY: i64 = -1;

/// One published smoothed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Rounded mean of the last window, in milliseconds.
    pub average_ms: i64,
    /// Two large delays were published within [`DELAY_SURGE_WINDOW`].
    pub surge: bool,
}

/// Averages round-trip samples in fixed windows.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    window: Vec<f64>,
    latest: Option<i64>,
    last_large: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Monitor with an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounded sample, or [`UNKNOWN_DELAY`] if it is not a usable number.
    pub fn normalize(sample_ms: f64) -> i64 {
        if sample_ms.is_finite() && sample_ms >= 1.0 {
            sample_ms.round() as i64
        } else {
            UNKNOWN_DELAY
        }
    }

    /// Add a sample taken at `now`.
    ///
    /// Returns a report once the window is full. Unusable samples are
    /// dropped and never count towards the window.
    pub fn record(&mut self, sample_ms: f64, now: Instant) -> Option<HealthReport> {
        if Self::normalize(sample_ms) == UNKNOWN_DELAY {
            log::trace!("[Heartbeat] Ignoring sample {sample_ms}");
            return None;
        }
        self.window.push(sample_ms);
        if self.window.len() < HEALTH_WINDOW {
            return None;
        }

        let sum: f64 = self.window.iter().sum();
        let average_ms = (sum / self.window.len() as f64).round() as i64;
        self.window.clear();
        self.latest = Some(average_ms);

        let mut surge = false;
        if average_ms > LARGE_DELAY_MS {
            surge = self.last_large.is_some_and(|previous| {
                now.saturating_duration_since(previous) <= DELAY_SURGE_WINDOW
            });
            if surge {
                log::warn!("[Heartbeat] Delay surge: {average_ms}ms");
            }
            self.last_large = Some(now);
        }

        Some(HealthReport { average_ms, surge })
    }

    /// Last published value, or [`UNKNOWN_DELAY`] before the first window.
    pub fn latest(&self) -> i64 {
        self.latest.unwrap_or(UNKNOWN_DELAY)
    }

    /// Samples collected towards the current window.
    pub fn pending(&self) -> usize {
        self.window.len()
    }
}
