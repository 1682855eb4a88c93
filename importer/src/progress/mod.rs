//! Import progress reporting.
//!
//! Progress is a per-owner counter in percent. Counters only ever grow:
//! updates add the positive difference between the new value and the
//! current one, so a scrape never sees progress go backwards.

mod reader;
mod transfer;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use importer_shared::constants::metrics::{OWNER_UID_LABEL, PROGRESS_NAME};
use parking_lot::Mutex;

pub use reader::{ProgressReader, ProgressTicker, ReadCount, start_ticker};
pub use transfer::TransferProgress;

/// Registry of progress counters keyed by owner UID.
///
/// Cloneable handle; clones share the same counters.
#[derive(Clone, Default)]
pub struct ProgressMetrics {
    counters: Arc<Mutex<BTreeMap<String, Arc<AtomicU64>>>>,
}

impl ProgressMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `owner_uid`, created at zero on first use.
    pub fn counter(&self, owner_uid: &str) -> ProgressCounter {
        let mut counters = self.counters.lock();
        let value = counters
            .entry(owner_uid.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0f64.to_bits())));
        ProgressCounter {
            value: Arc::clone(value),
        }
    }

    /// Current value for `owner_uid`, if a counter exists.
    pub fn get(&self, owner_uid: &str) -> Option<f64> {
        self.counters
            .lock()
            .get(owner_uid)
            .map(|v| f64::from_bits(v.load(Ordering::Relaxed)))
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP {} The import progress in percentage", PROGRESS_NAME);
        let _ = writeln!(out, "# TYPE {} counter", PROGRESS_NAME);
        for (owner, value) in self.counters.lock().iter() {
            let _ = writeln!(
                out,
                "{}{{{}=\"{}\"}} {}",
                PROGRESS_NAME,
                OWNER_UID_LABEL,
                owner,
                f64::from_bits(value.load(Ordering::Relaxed))
            );
        }
        out
    }
}

/// Monotonic progress counter for one owner.
#[derive(Clone)]
pub struct ProgressCounter {
    value: Arc<AtomicU64>,
}

impl ProgressCounter {
    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }

    /// Add a non-negative delta. Negative or NaN deltas are ignored.
    pub fn add(&self, delta: f64) {
        if delta.is_nan() || delta <= 0.0 {
            return;
        }
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    /// Raise the counter to `percent` if it is below it.
    pub fn advance_to(&self, percent: f64) {
        let current = self.get();
        if percent > current {
            self.add(percent - current);
        }
    }
}
