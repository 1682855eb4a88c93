//! Destination space accounting.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use importer_shared::{ImportError, ImportResult};
use nix::sys::statvfs::statvfs;

use crate::sink::is_block_device;

/// Bytes available to an unprivileged writer at `path`, or `None` if the
/// filesystem cannot be queried (e.g. the directory does not exist).
pub fn available_space(path: &Path) -> Option<u64> {
    match statvfs(path) {
        Ok(stat) => Some(stat.blocks_available() as u64 * stat.fragment_size() as u64),
        Err(e) => {
            tracing::debug!("Unable to stat filesystem at {}: {}", path.display(), e);
            None
        }
    }
}

/// Size of the block device at `path`, or `None` if it is not one.
pub fn block_device_size(path: &Path) -> Option<u64> {
    if !is_block_device(path) {
        return None;
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("Unable to open block device {}: {}", path.display(), e);
            return None;
        }
    };
    match file.seek(SeekFrom::End(0)) {
        Ok(size) => Some(size),
        Err(e) => {
            tracing::error!("Unable to size block device {}: {}", path.display(), e);
            None
        }
    }
}

/// Space left once filesystem overhead is reserved, rounded down to a
/// 512-byte multiple so qemu's own rounding up never overshoots.
pub fn usable_space(filesystem_overhead: f64, available: u64) -> u64 {
    let usable = ((1.0 - filesystem_overhead) * available as f64).max(0.0) as u64;
    usable / 512 * 512
}

/// Remove everything inside `dir`, leaving `dir` itself. A missing directory
/// is not an error.
pub fn clean_dir(dir: &Path) -> ImportResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ImportError::from_io(format!("read {}", dir.display()), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| ImportError::from_io(format!("read {}", dir.display()), e))?;
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| ImportError::from_io(format!("remove {}", path.display()), e))?;
    }
    Ok(())
}

/// Parse a Kubernetes resource quantity (`10Gi`, `500M`, `1.5e9`, `4096`)
/// into bytes, rounding fractional results up.
pub fn parse_quantity(quantity: &str) -> ImportResult<u64> {
    let invalid = || ImportError::InvalidArgument(format!("invalid quantity '{}'", quantity));
    let s = quantity.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    if value < 0.0 {
        return Err(invalid());
    }

    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        exp if exp.starts_with(['e', 'E']) => {
            let power: i32 = exp[1..].parse().map_err(|_| invalid())?;
            10f64.powi(power)
        }
        _ => return Err(invalid()),
    };

    let bytes = (value * multiplier).ceil();
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}
