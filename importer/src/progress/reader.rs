//! Counting reader that feeds the progress counter.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use importer_shared::constants::transfer::POLL_INTERVAL_MS;

use super::ProgressCounter;

#[derive(Default)]
struct ReadState {
    current: AtomicU64,
    done: AtomicBool,
}

/// Shared view of how many bytes a [`ProgressReader`] has delivered.
#[derive(Clone)]
pub struct ReadCount {
    state: Arc<ReadState>,
}

impl ReadCount {
    pub fn current(&self) -> u64 {
        self.state.current.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Relaxed)
    }
}

/// Reader that counts bytes and reports percent-of-total progress.
pub struct ProgressReader<R> {
    inner: R,
    state: Arc<ReadState>,
    total: u64,
    counter: Option<ProgressCounter>,
}

impl<R: Read> ProgressReader<R> {
    /// Count bytes of `inner`. `total` of 0 means the size is unknown and no
    /// percentage is reported.
    pub fn new(inner: R, total: u64, counter: Option<ProgressCounter>) -> Self {
        Self {
            inner,
            state: Arc::new(ReadState::default()),
            total,
            counter,
        }
    }

    pub fn count(&self) -> ReadCount {
        ReadCount {
            state: Arc::clone(&self.state),
        }
    }

    /// Start a background thread that publishes progress once a second until
    /// the stream is exhausted or the returned ticker is dropped.
    pub fn start_timed_update(&self) -> Option<ProgressTicker> {
        start_ticker(self.count(), self.total, self.counter.clone()?)
    }
}

/// Publish progress of `count` against `total` from a background thread.
/// Returns `None` when the total is unknown.
pub fn start_ticker(count: ReadCount, total: u64, counter: ProgressCounter) -> Option<ProgressTicker> {
    if total == 0 {
        return None;
    }
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let handle = std::thread::Builder::new()
        .name("progress-ticker".into())
        .spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
                if !update_progress(&count, total, &counter) {
                    break;
                }
            }
        })
        .map_err(|e| tracing::warn!("Failed to spawn progress thread: {}", e))
        .ok()?;

    Some(ProgressTicker {
        stop,
        handle: Some(handle),
    })
}

/// Publish the current percentage. Returns false once the stream is done.
pub(crate) fn update_progress(count: &ReadCount, total: u64, counter: &ProgressCounter) -> bool {
    if total == 0 {
        return false;
    }
    let current = count.current();
    let percent = if !count.is_done() && current < total {
        current as f64 / total as f64 * 100.0
    } else {
        100.0
    };
    counter.advance_to(percent);
    tracing::debug!("{:.2}", percent);
    !count.is_done()
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.state.current.fetch_add(n as u64, Ordering::Relaxed);
        if n == 0 && !buf.is_empty() {
            self.state.done.store(true, Ordering::Relaxed);
        }
        Ok(n)
    }
}

/// Handle to the progress thread; stops and joins it on drop.
pub struct ProgressTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
