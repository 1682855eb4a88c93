//! nbdkit output scanning.
//!
//! The VDDK plugin is very chatty. Only a tail of the output is kept and
//! dumped once nbdkit exits; the VDDK version and the ESX host that served
//! the disk are picked out as lines go by.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};

use importer_shared::{ImportError, ImportResult, VddkInfo};
use parking_lot::Mutex;
use regex::Regex;

/// "nbdkit: debug: VMware VixDiskLib (7.0.0) Release build-15832853"
static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((?P<version>.*)\).*build-(?P<build>.*)").expect("valid version pattern")
});

/// "... Opened 'vpxa-nfcssl://[ds] vm/vm.vmdk@esx12.test.local:902' (0xa): custom, ..."
static HOST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Opened '.*@(?P<host>.*):.*' \(0x").expect("valid host pattern")
});

const VERSION_PREFIX: &str = "nbdkit: debug: VMware VixDiskLib";
const HOST_PREFIX: &str = "nbdkit: vddk[1]: debug: DISKLIB-LINK  : Opened ";
const PASSWORD_MARKER: &str = "vddk: config key=password";

/// What the watcher has learned from the log so far.
#[derive(Debug)]
pub struct NbdkitLog {
    info: VddkInfo,
    tail: VecDeque<String>,
    capacity: usize,
}

impl NbdkitLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            info: VddkInfo::default(),
            tail: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn info(&self) -> &VddkInfo {
        &self.info
    }

    /// Retained lines, oldest first, without password lines.
    pub fn tail(&self) -> impl Iterator<Item = &str> {
        self.tail
            .iter()
            .map(String::as_str)
            .filter(|line| !line.contains(PASSWORD_MARKER))
    }

    pub fn record(&mut self, line: &str) {
        if line.starts_with(VERSION_PREFIX) {
            if let Some(version) = find_match(&VERSION_PATTERN, line, "version") {
                tracing::info!("VDDK version in-use: {}", version);
                self.info.version = version;
            }
        } else if line.starts_with(HOST_PREFIX)
            && let Some(host) = find_match(&HOST_PATTERN, line, "host")
        {
            tracing::info!("VDDK connected to host: {}", host);
            self.info.host = host;
        }

        if self.capacity == 0 {
            return;
        }
        if self.tail.len() == self.capacity {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }
}

fn find_match(pattern: &Regex, line: &str, group: &str) -> Option<String> {
    pattern
        .captures(line)
        .and_then(|caps| caps.name(group))
        .map(|m| m.as_str().to_string())
}

/// Thread reading nbdkit's combined stdout and stderr.
pub(super) struct LogWatcher {
    thread: Option<JoinHandle<()>>,
}

impl LogWatcher {
    pub(super) fn start<R: Read + Send + 'static>(
        output: R,
        log: Arc<Mutex<NbdkitLog>>,
    ) -> ImportResult<Self> {
        let thread = thread::Builder::new()
            .name("nbdkit-log".into())
            .spawn(move || {
                let reader = BufReader::new(output);
                for line in reader.lines() {
                    match line {
                        Ok(line) => log.lock().record(&line),
                        Err(e) => {
                            tracing::error!("Error watching nbdkit log: {}", e);
                            break;
                        }
                    }
                }

                tracing::info!("Stopped watching nbdkit log. Last lines follow:");
                for line in log.lock().tail() {
                    tracing::info!(target: "nbdkit", "Log line from nbdkit: {}", line);
                }
                tracing::info!("End of nbdkit log.");
            })
            .map_err(|e| ImportError::Execution(format!("Failed to spawn nbdkit log thread: {}", e)))?;
        Ok(Self { thread: Some(thread) })
    }

    /// Wait for the output pipe to close. nbdkit has to be stopped first.
    pub(super) fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            tracing::debug!("Waiting for nbdkit log watcher to stop");
            if let Err(e) = handle.join() {
                tracing::warn!("nbdkit log watcher panicked: {:?}", e);
            }
        }
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION_LINE: &str = "nbdkit: debug: VMware VixDiskLib (7.0.0) Release build-15832853";
    const HOST_LINE: &str = "nbdkit: vddk[1]: debug: DISKLIB-LINK  : Opened 'vpxa-nfcssl://[iSCSI_Datastore] test/test.vmdk@esx12.test.local:902' (0xa): custom, 50331648 sectors / 24 GB.";

    #[test]
    fn test_version_and_host() {
        let mut log = NbdkitLog::new(10);
        log.record("nbdkit: debug: starting");
        log.record(VERSION_LINE);
        log.record(HOST_LINE);
        assert_eq!(log.info().version, "7.0.0");
        assert_eq!(log.info().host, "esx12.test.local");
    }

    #[test]
    fn test_unprefixed_lines_are_ignored() {
        let mut log = NbdkitLog::new(10);
        log.record("VMware VixDiskLib (9.9.9) Release build-1");
        assert!(log.info().version.is_empty());
    }

    #[test]
    fn test_tail_is_bounded() {
        let mut log = NbdkitLog::new(3);
        for i in 0..5 {
            log.record(&format!("line {}", i));
        }
        let tail: Vec<&str> = log.tail().collect();
        assert_eq!(tail, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_password_lines_are_hidden() {
        let mut log = NbdkitLog::new(10);
        log.record("nbdkit: debug: vddk: config key=password, value=hunter2");
        log.record("nbdkit: debug: vddk: config key=user, value=root");
        let tail: Vec<&str> = log.tail().collect();
        assert_eq!(tail, vec!["nbdkit: debug: vddk: config key=user, value=root"]);
    }

    #[test]
    fn test_watcher_reads_until_eof() {
        let log = Arc::new(Mutex::new(NbdkitLog::new(10)));
        let output = format!("{}\n{}\n", VERSION_LINE, HOST_LINE);
        let mut watcher =
            LogWatcher::start(std::io::Cursor::new(output.into_bytes()), log.clone()).expect("Should start");
        watcher.stop();
        assert_eq!(log.lock().info().host, "esx12.test.local");
        assert_eq!(log.lock().tail().count(), 2);
    }
}
