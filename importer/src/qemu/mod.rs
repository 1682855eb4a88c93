//! Image operations delegated to QEMU's image tool.
//!
//! [`QemuOperations`] is the seam the processor and sources call through;
//! [`QemuImg`] runs the real `qemu-img` binary.

mod limits;
mod qemu_img;

use std::path::Path;
use std::sync::LazyLock;

use importer_shared::{ImportError, ImportResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use limits::{ProcessLimits, apply_limits_raw, limit_command};
pub use qemu_img::QemuImg;

/// Image details reported by `qemu-img info`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImgInfo {
    pub format: String,
    #[serde(rename = "backing-filename", default)]
    pub backing_file: String,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
}

/// Operations on disk images.
pub trait QemuOperations: Send + Sync {
    /// Inspect the image at `url` (a local path or an HTTP(S) URL).
    fn info(&self, url: &str) -> ImportResult<ImgInfo>;

    /// Convert the image at `url` to raw at `dest`.
    fn convert_to_raw_stream(&self, url: &str, dest: &Path, preallocate: bool) -> ImportResult<()>;

    /// Resize the raw image at `image` to `size` bytes.
    fn resize(&self, image: &Path, size: u64, preallocate: bool) -> ImportResult<()>;

    /// Create an empty raw image of `size` bytes.
    fn create_blank_image(&self, dest: &Path, size: u64, preallocate: bool) -> ImportResult<()>;

    /// Rewrite the raw image at `image` onto itself with every block allocated.
    fn preallocate(&self, image: &Path) -> ImportResult<()>;

    /// Check that the image at `url` has no backing file and that its virtual
    /// size, plus filesystem overhead, fits in `available_space`.
    fn validate(
        &self,
        url: &str,
        available_space: u64,
        filesystem_overhead: f64,
    ) -> ImportResult<ImgInfo> {
        let info = self.info(url)?;
        if !info.backing_file.is_empty() {
            return Err(ImportError::InvalidArgument(format!(
                "image {} is invalid because it has backing file {}",
                url, info.backing_file
            )));
        }
        let needed = info.virtual_size as f64 * (1.0 + filesystem_overhead);
        if needed > available_space as f64 {
            return Err(ImportError::ValidationSize(format!(
                "virtual image size {} is larger than the reported available storage {}. \
                 A larger PVC is required",
                info.virtual_size, available_space
            )));
        }
        Ok(info)
    }
}

static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d{1,3}\.\d{1,2})/100%\)").expect("progress regex is valid"));

/// Percentage from a `qemu-img -p` progress line such as `    (45.01/100%)`.
pub fn parse_progress(line: &str) -> Option<f64> {
    PROGRESS_RE
        .captures_iter(line)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
