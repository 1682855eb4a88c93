//! Byte-level progress logging for block copies.

use std::time::Instant;

use super::ProgressCounter;

/// Logs copy progress at 1% steps with overall and last-step throughput.
pub struct TransferProgress {
    total: u64,
    current: u64,
    previous_bytes: u64,
    previous_percent: u64,
    previous_time: Instant,
    start: Instant,
    counter: Option<ProgressCounter>,
}

impl TransferProgress {
    pub fn new(total: u64, counter: Option<ProgressCounter>) -> Self {
        let now = Instant::now();
        Self {
            total,
            current: 0,
            previous_bytes: 0,
            previous_percent: 0,
            previous_time: now,
            start: now,
            counter,
        }
    }

    pub fn transferred(&self) -> u64 {
        self.current
    }

    /// Record `written` more bytes.
    pub fn update(&mut self, written: u64) {
        self.current += written;
        if self.total == 0 {
            return;
        }
        let percent = (100.0 * (self.current as f64 / self.total as f64)) as u64;
        if percent > self.previous_percent {
            let now = Instant::now();
            tracing::info!("{}", self.message(percent, now));
            self.previous_bytes = self.current;
            self.previous_time = now;
            self.previous_percent = percent;
        }
        if let Some(counter) = &self.counter
            && percent > 0
        {
            counter.advance_to(percent as f64);
        }
    }

    fn message(&self, percent: u64, now: Instant) -> String {
        let mut message = format!(
            "Transferred {}/{} bytes ({}%)",
            self.current, self.total, percent
        );
        let overall = now.duration_since(self.start).as_secs();
        if overall > 0 {
            message.push_str(&format!(
                " at {} bytes/second overall",
                self.current / overall
            ));
        }
        let step = now.duration_since(self.previous_time).as_secs();
        if step > 0 {
            let size = self.current - self.previous_bytes;
            message.push_str(&format!(
                ", last 1% was {} bytes at {} bytes/second",
                size,
                size / step
            ));
        }
        message
    }
}
