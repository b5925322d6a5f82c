use std::collections::VecDeque;

use chrono::{DateTime, Duration, Local};

const WINDOW_SECONDS: i64 = 20;

/// Download-rate meter over a rolling 20 second window.
///
/// Every fulfilled block records its byte count; the rate is the bytes seen
/// inside the window averaged over the whole window, so an idle peer decays
/// towards zero instead of keeping its historical best.
#[derive(Debug)]
pub struct RollingRate {
    samples: VecDeque<(DateTime<Local>, u64)>,
    window_bytes: u64,
}

impl RollingRate {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            window_bytes: 0,
        }
    }

    /// Records received bytes at the current time.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Local::now(), bytes);
    }

    /// Returns the current rate in bytes per second.
    pub fn rate(&mut self) -> f64 {
        self.prune(Local::now());
        self.window_bytes as f64 / WINDOW_SECONDS as f64
    }

    fn record_at(&mut self, at: DateTime<Local>, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.window_bytes += bytes;
        self.prune(at);
    }

    fn prune(&mut self, now: DateTime<Local>) {
        let horizon = Duration::seconds(WINDOW_SECONDS);
        while let Some((at, bytes)) = self.samples.front() {
            if now.signed_duration_since(*at) <= horizon {
                break;
            }
            self.window_bytes -= bytes;
            self.samples.pop_front();
        }
    }
}

impl Default for RollingRate {
    fn default() -> Self {
        Self::new()
    }
}
