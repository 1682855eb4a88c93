use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use importer_shared::constants::qemu::{HTTP_READ_TIMEOUT_SECS, MAX_CPU_SECS, MAX_MEMORY};
use importer_shared::{ImportError, ImportResult};

use super::{ImgInfo, ProcessLimits, QemuOperations, limit_command, parse_progress};
use crate::progress::ProgressCounter;
use crate::sink::is_block_device;

/// [`QemuOperations`] backed by the `qemu-img` binary.
#[derive(Clone)]
pub struct QemuImg {
    binary: PathBuf,
    progress: Option<ProgressCounter>,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

impl QemuImg {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("qemu-img"),
            progress: None,
        }
    }

    /// Use a specific binary instead of `qemu-img` from `PATH`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Feed conversion progress into `counter`.
    pub fn with_progress(mut self, counter: ProgressCounter) -> Self {
        self.progress = Some(counter);
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Run to completion, returning stdout. Failures carry stderr.
    fn run(&self, mut cmd: Command, what: &str) -> ImportResult<Vec<u8>> {
        tracing::debug!("Running {:?}", cmd);
        let output = cmd.output().map_err(|e| {
            ImportError::Execution(format!(
                "Failed to run {} for {}: {}",
                self.binary.display(),
                what,
                e
            ))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("{} failed, output is:\n{}", what, stderr);
            return Err(failure(what, output.status.code(), &stderr));
        }
        Ok(output.stdout)
    }
}

/// Source argument for qemu-img: HTTP(S) origins go through the curl driver
/// with a long read timeout.
fn source_arg(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => format!(
            "json: {{\"file.driver\": \"{}\", \"file.url\": \"{}\", \"file.timeout\": {}}}",
            parsed.scheme(),
            url,
            HTTP_READ_TIMEOUT_SECS
        ),
        _ => url.to_string(),
    }
}

fn failure(what: &str, code: Option<i32>, stderr: &str) -> ImportError {
    let message = format!(
        "{} failed (exit code {}): {}",
        what,
        code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        stderr.trim()
    );
    if stderr.contains("No space left on device") || stderr.contains("Disk quota exceeded") {
        ImportError::NoCapacity(message)
    } else {
        ImportError::Execution(message)
    }
}

impl QemuOperations for QemuImg {
    fn info(&self, url: &str) -> ImportResult<ImgInfo> {
        let mut cmd = self.command();
        cmd.args(["info", "--output=json"]).arg(source_arg(url));
        limit_command(
            &mut cmd,
            ProcessLimits {
                max_memory: Some(MAX_MEMORY),
                max_cpu_secs: Some(MAX_CPU_SECS),
            },
        );
        let stdout = self.run(cmd, "qemu-img info")?;
        serde_json::from_slice(&stdout).map_err(|e| {
            tracing::error!("Invalid JSON:\n{}", String::from_utf8_lossy(&stdout));
            ImportError::Execution(format!("Invalid json for image {}: {}", url, e))
        })
    }

    fn convert_to_raw_stream(&self, url: &str, dest: &Path, preallocate: bool) -> ImportResult<()> {
        let mut cmd = self.command();
        cmd.args(["convert", "-t", "writeback", "-p", "-O", "raw"]);
        if preallocate {
            tracing::info!("Added preallocation");
            cmd.args(["-o", "preallocation=falloc"]);
        }
        cmd.arg(source_arg(url)).arg(dest);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        tracing::info!("Converting {} to raw at {}", url, dest.display());

        let mut child = cmd.spawn().map_err(|e| {
            ImportError::Execution(format!("Failed to start {}: {}", self.binary.display(), e))
        })?;

        let stderr_thread = child.stderr.take().and_then(|mut stderr| {
            std::thread::Builder::new()
                .name("qemu-img-stderr".into())
                .spawn(move || {
                    let mut text = String::new();
                    let _ = stderr.read_to_string(&mut text);
                    text
                })
                .ok()
        });

        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = [0u8; 4096];
            let mut pending = String::new();
            while let Ok(n) = stdout.read(&mut buf) {
                if n == 0 {
                    break;
                }
                pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                // Progress lines are terminated by '\r'.
                while let Some(pos) = pending.find(['\r', '\n']) {
                    let line: String = pending.drain(..=pos).collect();
                    if let (Some(percent), Some(counter)) = (parse_progress(&line), &self.progress) {
                        counter.advance_to(percent);
                    }
                }
            }
        }

        let status = child.wait().map_err(|e| {
            ImportError::Execution(format!("Failed to wait for qemu-img convert: {}", e))
        })?;
        let stderr = stderr_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();
        if !status.success() {
            tracing::error!("qemu-img convert failed, output is:\n{}", stderr);
            return Err(failure("qemu-img convert", status.code(), &stderr)
                .context("could not stream/convert image to raw"));
        }
        Ok(())
    }

    fn resize(&self, image: &Path, size: u64, preallocate: bool) -> ImportResult<()> {
        let mut cmd = self.command();
        cmd.args(["resize", "-f", "raw"]);
        if preallocate {
            cmd.arg("--preallocation=falloc");
        }
        cmd.arg(image).arg(size.to_string());
        tracing::info!("Resizing {} to {} bytes", image.display(), size);
        self.run(cmd, "qemu-img resize")
            .map(|_| ())
            .map_err(|e| e.context("Error resizing image"))
    }

    fn create_blank_image(&self, dest: &Path, size: u64, preallocate: bool) -> ImportResult<()> {
        let mut cmd = self.command();
        cmd.args(["create", "-f", "raw"]);
        if preallocate {
            cmd.args(["-o", "preallocation=falloc"]);
        }
        cmd.arg(dest).arg(size.to_string());
        tracing::info!("Creating blank raw image: {} ({} bytes)", dest.display(), size);
        self.run(cmd, "qemu-img create")
            .map(|_| ())
            .map_err(|e| e.context("could not create raw image"))
    }

    /// Convert the image onto a sibling with preallocation on, then move it
    /// back over the original. Block devices are already fully backed.
    fn preallocate(&self, image: &Path) -> ImportResult<()> {
        if is_block_device(image) {
            return Ok(());
        }
        let staging = image.with_extension("prealloc");
        tracing::info!("Preallocating {} through {}", image.display(), staging.display());
        self.convert_to_raw_stream(&image.to_string_lossy(), &staging, true)
            .map_err(|e| {
                let _ = std::fs::remove_file(&staging);
                e.context("could not preallocate image")
            })?;
        std::fs::rename(&staging, image)
            .map_err(|e| ImportError::from_io(format!("rename {}", staging.display()), e))
    }
}
