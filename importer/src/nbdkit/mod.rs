//! nbdkit process supervision.
//!
//! [`Nbdkit`] runs one `nbdkit` serving a VMware disk through the VDDK
//! plugin on a Unix socket. The process is started in the foreground with
//! `--exit-with-parent`, its output is scanned by a log watcher, and
//! readiness is signalled by the PID file appearing.

mod log_watch;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use importer_shared::constants::nbdkit as defaults;
use importer_shared::{ImportError, ImportResult, VddkInfo};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

pub use log_watch::NbdkitLog;
use log_watch::LogWatcher;

use crate::util::configure_library_env;
use crate::util::process::{signal_process, wait_for_pid_file};

/// Filters stacked in front of the VDDK plugin.
const FILTERS: &[&str] = &["retry", "cacheextents"];

/// Directory nbdkit loads plugins from.
const PLUGIN_DIR: &str = "/usr/lib64/nbdkit";

/// How long nbdkit gets to exit after SIGINT before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Where nbdkit and the VDDK libraries live.
#[derive(Clone, Debug)]
pub struct NbdkitConfig {
    /// nbdkit executable
    pub binary: PathBuf,
    /// Plugin name or path to a plugin shared object
    pub plugin: String,
    /// VDDK distribution, passed to the plugin as `libdir`
    pub lib_dir: PathBuf,
    /// Added to the dynamic loader path
    pub library_path: PathBuf,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
    pub pid_poll_interval: Duration,
    pub start_timeout: Duration,
    pub max_log_lines: usize,
}

impl Default for NbdkitConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nbdkit"),
            plugin: vddk_plugin(),
            lib_dir: PathBuf::from(defaults::VDDK_LIB_DIR),
            library_path: PathBuf::from(defaults::VDDK_LIB64_DIR),
            socket: PathBuf::from(defaults::SOCKET),
            pid_file: PathBuf::from(defaults::PID_FILE),
            pid_poll_interval: Duration::from_millis(defaults::PID_POLL_INTERVAL_MS),
            start_timeout: Duration::from_secs(defaults::PID_WAIT_TIMEOUT_SECS),
            max_log_lines: defaults::MAX_LOG_LINES,
        }
    }
}

/// The test plugin when one is installed, the real VDDK plugin otherwise.
pub fn vddk_plugin() -> String {
    if Path::new(defaults::MOCK_PLUGIN).exists() {
        return defaults::MOCK_PLUGIN.to_string();
    }
    defaults::VDDK_PLUGIN.to_string()
}

/// Connection details handed to the VDDK plugin.
#[derive(Clone, Debug, Default)]
pub struct VddkPluginArgs {
    pub server: String,
    pub username: String,
    pub password: String,
    pub thumbprint: String,
    pub moref: String,
    pub snapshot: Option<String>,
    /// Optional `vddk-config-file`
    pub config_file: Option<PathBuf>,
}

/// One supervised nbdkit process.
pub struct Nbdkit {
    config: NbdkitConfig,
    plugin_args: Vec<String>,
    /// Holds the password referenced by `password=+<file>`
    _password_file: NamedTempFile,
    child: Option<Child>,
    watcher: Option<LogWatcher>,
    log: Arc<Mutex<NbdkitLog>>,
    /// PID of the running child, 0 when none
    live_pid: Arc<AtomicU32>,
}

/// Stops an [`Nbdkit`] from another thread.
///
/// Only signals the process; the owner still reaps it.
#[derive(Clone, Debug)]
pub struct NbdkitStopper {
    live_pid: Arc<AtomicU32>,
    pid_file: PathBuf,
}

impl NbdkitStopper {
    /// Interrupt nbdkit if it is running. Later calls do nothing.
    pub fn stop(&self) {
        let pid = self.live_pid.swap(0, Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        if signal_process(pid, Signal::SIGINT) {
            tracing::info!(pid, "Interrupted nbdkit");
        } else {
            tracing::warn!(pid, "Failed to interrupt nbdkit");
        }
        let _ = std::fs::remove_file(&self.pid_file);
    }
}

impl Nbdkit {
    /// Prepare nbdkit for the VDDK plugin. The plugin is checked but nothing
    /// is started yet.
    pub fn new_vddk(config: NbdkitConfig, args: &VddkPluginArgs) -> ImportResult<Self> {
        let mut password_file = NamedTempFile::new()
            .map_err(|e| ImportError::from_io("Unable to create nbdkit password file", e))?;
        password_file
            .write_all(args.password.as_bytes())
            .and_then(|_| password_file.flush())
            .map_err(|e| ImportError::from_io("Unable to write nbdkit password file", e))?;

        let mut plugin_args = vec![
            format!("libdir={}", config.lib_dir.display()),
            format!("server={}", args.server),
            format!("user={}", args.username),
            format!("password=+{}", password_file.path().display()),
            format!("thumbprint={}", args.thumbprint),
            format!("vm=moref={}", args.moref),
        ];
        if let Some(snapshot) = args.snapshot.as_deref().filter(|s| !s.is_empty()) {
            plugin_args.push(format!("snapshot={}", snapshot));
            plugin_args.push("transports=file:nbdssl:nbd".into());
        }
        if let Some(config_file) = args.config_file.as_deref().filter(|p| p.exists()) {
            plugin_args.push(format!("config={}", config_file.display()));
        }

        let log = Arc::new(Mutex::new(NbdkitLog::new(config.max_log_lines)));
        let nbdkit = Self {
            config,
            plugin_args,
            _password_file: password_file,
            child: None,
            watcher: None,
            log,
            live_pid: Arc::new(AtomicU32::new(0)),
        };
        nbdkit.validate_plugin()?;
        Ok(nbdkit)
    }

    /// Ask nbdkit to load the plugin and describe it.
    pub fn validate_plugin(&self) -> ImportResult<()> {
        log_tree("nbdkit plugin", Path::new(PLUGIN_DIR));
        log_tree("VDDK library", &self.config.lib_dir);

        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--dump-plugin")
            .arg(&self.config.plugin)
            .arg(format!("libdir={}", self.config.lib_dir.display()));
        configure_library_env(&mut cmd, &self.config.library_path);

        let output = cmd.output().map_err(|e| {
            ImportError::NbdkitPluginMissing(format!(
                "unable to run {}: {}",
                self.config.binary.display(),
                e
            ))
        })?;
        tracing::info!(
            "Output from nbdkit --dump-plugin {}: {}{}",
            self.config.plugin,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(ImportError::NbdkitPluginMissing(format!(
                "{} ({})",
                self.config.plugin, output.status
            )));
        }
        Ok(())
    }

    fn command_args(&self, source_file: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--foreground".into(),
            "--readonly".into(),
            "--exit-with-parent".into(),
            "-U".into(),
            self.config.socket.display().to_string(),
            "--pidfile".into(),
            self.config.pid_file.display().to_string(),
        ];
        args.extend(FILTERS.iter().map(|f| format!("--filter={}", f)));
        args.push(self.config.plugin.clone());
        args.extend(self.plugin_args.iter().cloned());
        args.extend([
            "--verbose".into(),
            "-D".into(),
            "nbdkit.backend.datapath=0".into(),
            "-D".into(),
            "vddk.datapath=0".into(),
            "-D".into(),
            "vddk.stats=1".into(),
        ]);
        args.push(format!("file={}", source_file));
        args
    }

    /// Start serving `source_file` and wait until nbdkit is ready.
    pub fn start(&mut self, source_file: &str) -> ImportResult<()> {
        if self.child.is_some() {
            return Err(ImportError::Internal("nbdkit is already running".into()));
        }
        match std::fs::remove_file(&self.config.pid_file) {
            Ok(()) => tracing::debug!("Removed stale PID file {}", self.config.pid_file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ImportError::from_io("Unable to remove stale nbdkit PID file", e)),
        }

        let args = self.command_args(source_file);
        tracing::info!(
            "Starting nbdkit: {} {}",
            self.config.binary.display(),
            quoted_args(&args)
        );

        let (reader, writer) = std::io::pipe()
            .map_err(|e| ImportError::from_io("Error constructing nbdkit output pipe", e))?;
        let stderr = writer
            .try_clone()
            .map_err(|e| ImportError::from_io("Error constructing nbdkit output pipe", e))?;

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr));
        configure_library_env(&mut cmd, &self.config.library_path);

        let child = cmd
            .spawn()
            .map_err(|e| ImportError::Execution(format!("Unable to start nbdkit: {}", e)))?;
        // The command holds the write ends; the watcher sees EOF only once
        // they are all closed.
        drop(cmd);
        tracing::info!(pid = child.id(), "nbdkit started");
        self.live_pid.store(child.id(), Ordering::SeqCst);
        self.child = Some(child);
        self.watcher = Some(LogWatcher::start(reader, self.log.clone())?);

        tracing::info!("Waiting for nbdkit PID.");
        let child = &mut self.child;
        let pid = wait_for_pid_file(
            &self.config.pid_file,
            self.config.pid_poll_interval,
            self.config.start_timeout,
            || child.as_mut().is_some_and(|c| matches!(c.try_wait(), Ok(None))),
        );
        match pid {
            Some(pid) => {
                tracing::info!(pid, "nbdkit ready.");
                Ok(())
            }
            None => {
                if let Err(e) = self.kill() {
                    tracing::warn!("Unable to stop nbdkit after failed start: {}", e);
                }
                Err(ImportError::NbdkitStartTimeout(format!(
                    "no PID file at {} after {:?}",
                    self.config.pid_file.display(),
                    self.config.start_timeout
                )))
            }
        }
    }

    /// Stop nbdkit and wait for its output to drain. Safe to call repeatedly.
    pub fn kill(&mut self) -> ImportResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.live_pid.store(0, Ordering::SeqCst);
        let pid = child.id();

        let mut stopped = false;
        if signal_process(pid, Signal::SIGINT) {
            let deadline = Instant::now() + STOP_GRACE;
            while Instant::now() < deadline {
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::info!(pid, %status, "nbdkit exited");
                    stopped = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        } else {
            tracing::warn!(pid, "Failed to interrupt nbdkit, killing it");
        }

        let result = if stopped {
            Ok(())
        } else {
            child
                .kill()
                .and_then(|_| child.wait())
                .map(|status| tracing::info!(pid, %status, "nbdkit killed"))
                .map_err(|e| ImportError::Execution(format!("Unable to kill nbdkit: {}", e)))
        };

        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        let _ = std::fs::remove_file(&self.config.pid_file);
        result
    }

    pub fn socket(&self) -> &Path {
        &self.config.socket
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn stopper(&self) -> NbdkitStopper {
        NbdkitStopper {
            live_pid: self.live_pid.clone(),
            pid_file: self.config.pid_file.clone(),
        }
    }

    /// VDDK version and ESX host seen in the log so far.
    pub fn vddk_info(&self) -> VddkInfo {
        self.log.lock().info().clone()
    }
}

impl Drop for Nbdkit {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!("Failed to stop nbdkit: {}", e);
        }
    }
}

fn log_tree(what: &str, root: &Path) {
    tracing::debug!("Checking {} directory tree:", what);
    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                if let Ok(meta) = entry.metadata() {
                    tracing::debug!("{}: {} {:o}", entry.path().display(), meta.len(), meta_mode(&meta));
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Unable to get {} directory tree: {}", what, e);
                break;
            }
        }
    }
}

fn meta_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

/// Render arguments for the log, quoting each and hiding secrets.
fn quoted_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, _)) if key == "password" => "'password=*****'".to_string(),
            _ => format!("'{}'", arg),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
