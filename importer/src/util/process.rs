//! PID file and process liveness helpers for supervised subprocesses.

use std::path::Path;
use std::time::{Duration, Instant};

use importer_shared::{ImportError, ImportResult};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Read PID from file.
///
/// The file contains a PID as a decimal string, optionally with a trailing
/// newline.
pub fn read_pid_file(path: &Path) -> ImportResult<u32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ImportError::Storage(format!("Failed to read PID file {}: {}", path.display(), e))
    })?;

    content.trim().parse::<u32>().map_err(|e| {
        ImportError::Storage(format!(
            "Invalid PID in file {}: '{}' - {}",
            path.display(),
            content.trim(),
            e
        ))
    })
}

/// Poll for a PID file until it holds a valid PID or `timeout` passes.
///
/// Returns `None` on timeout. `still_running` is consulted between polls so
/// a child that died early ends the wait.
pub fn wait_for_pid_file(
    path: &Path,
    interval: Duration,
    timeout: Duration,
    mut still_running: impl FnMut() -> bool,
) -> Option<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(pid) = read_pid_file(path) {
            return Some(pid);
        }
        if Instant::now() >= deadline || !still_running() {
            return None;
        }
        std::thread::sleep(interval);
    }
}

/// Send `signal` to `pid`.
///
/// # Returns
/// * `true` - Signal delivered, or the process no longer exists
/// * `false` - Delivery failed (e.g. permission denied)
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    kill(Pid::from_raw(pid as i32), signal).is_ok() || !is_process_alive(pid)
}

/// Check if a process with the given PID exists.
///
/// Sends the null signal, so permission errors also read as "not alive".
pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        assert!(!is_process_alive(999999999));
        assert!(!is_process_alive(888888888));
    }

    #[test]
    fn test_signal_missing_process_counts_as_done() {
        assert!(signal_process(999999999, Signal::SIGTERM));
    }

    #[test]
    fn test_read_pid_file_valid() {
        let mut file = NamedTempFile::new().expect("Should create temp file");
        writeln!(file, "12345").expect("Should write PID");
        assert_eq!(read_pid_file(file.path()).expect("Should parse valid PID"), 12345);
    }

    #[test]
    fn test_read_pid_file_invalid() {
        let mut file = NamedTempFile::new().expect("Should create temp file");
        writeln!(file, "not-a-pid").expect("Should write content");
        assert!(read_pid_file(file.path()).is_err());
        assert!(read_pid_file(Path::new("/nonexistent/path/to/pid.file")).is_err());
    }

    #[test]
    fn test_wait_for_pid_file_appears() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("nbd.pid");
        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            std::fs::write(writer_path, "4242\n").expect("Should write PID file");
        });
        let pid = wait_for_pid_file(&path, Duration::from_millis(10), Duration::from_secs(5), || true);
        writer.join().expect("Writer should finish");
        assert_eq!(pid, Some(4242));
    }

    #[test]
    fn test_wait_for_pid_file_times_out() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("nbd.pid");
        let pid = wait_for_pid_file(
            &path,
            Duration::from_millis(10),
            Duration::from_millis(50),
            || true,
        );
        assert_eq!(pid, None);
    }

    #[test]
    fn test_wait_for_pid_file_stops_when_child_exits() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("nbd.pid");
        let started = Instant::now();
        let pid = wait_for_pid_file(&path, Duration::from_millis(10), Duration::from_secs(30), || false);
        assert_eq!(pid, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
