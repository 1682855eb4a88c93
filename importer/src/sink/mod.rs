//! Destination writers.
//!
//! [`StreamingSink`] writes a raw image to a regular file or a block device
//! with positional writes and hole punching. [`stream_data_to_file`] copies a
//! sequential stream, eliding all-zero ranges.

mod sparse;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use importer_shared::constants::transfer::ZERO_FILL_CHUNK;
use importer_shared::{ImportError, ImportResult};

pub use sparse::{append_zero_with_truncate, stream_data_to_file};

/// Whether `path` is a block device.
pub fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Writer for the destination image.
pub trait DataSink: Send {
    /// Write `buf` at `offset`, returning the bytes written. A count short of
    /// `buf.len()` is allowed; use [`pwrite_all`] to write everything.
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> ImportResult<usize>;

    /// Append `buf` at the current position.
    fn write(&mut self, buf: &[u8]) -> ImportResult<usize>;

    /// Make `[offset, offset + length)` read back as zeroes.
    fn zero_range(&mut self, offset: u64, length: u64) -> ImportResult<()>;

    /// Flush and sync.
    fn close(&mut self) -> ImportResult<()>;
}

/// Write all of `buf` at `offset`, retrying short writes. A sink that
/// accepts nothing is an error.
pub fn pwrite_all(sink: &mut dyn DataSink, buf: &[u8], offset: u64) -> ImportResult<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let written = sink.pwrite(&buf[done..], offset + done as u64)?;
        if written == 0 {
            return Err(ImportError::Storage(format!(
                "Wrote 0 of {} bytes at offset {}",
                buf.len() - done,
                offset + done as u64
            )));
        }
        done += written;
    }
    Ok(())
}

/// Fill `[offset, offset + length)` with explicit zero writes.
pub fn fill_zeroes(sink: &mut dyn DataSink, offset: u64, length: u64) -> ImportResult<()> {
    let zeroes = vec![0u8; ZERO_FILL_CHUNK.min(length as usize)];
    let mut count = 0u64;
    while count < length {
        let chunk = (length - count).min(zeroes.len() as u64) as usize;
        pwrite_all(sink, &zeroes[..chunk], offset + count)?;
        count += chunk as u64;
    }
    Ok(())
}

/// [`DataSink`] over a local file or block device.
pub struct StreamingSink {
    path: PathBuf,
    file: File,
    writer: BufWriter<File>,
    is_block: bool,
    closed: bool,
}

impl StreamingSink {
    /// Open the destination for a full copy.
    ///
    /// A block device is opened exclusively. A regular file must not exist;
    /// any stale file is removed first and a new one created exclusively.
    pub fn create(path: &Path, is_block: bool) -> ImportResult<Self> {
        let mut options = OpenOptions::new();
        options.write(true);
        if is_block {
            options.custom_flags(libc::O_EXCL);
        } else {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed stale destination {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ImportError::from_io(format!("remove {}", path.display()), e)),
            }
            options.create_new(true).mode(0o660);
        }
        Self::open_with(path, options, is_block)
    }

    /// Reopen an existing destination without truncating it, for delta copies.
    pub fn reopen(path: &Path, is_block: bool) -> ImportResult<Self> {
        if !path.exists() {
            return Err(ImportError::Storage(format!(
                "Disk image {} does not exist, cannot apply deltas",
                path.display()
            )));
        }
        let mut options = OpenOptions::new();
        options.write(true);
        Self::open_with(path, options, is_block)
    }

    fn open_with(path: &Path, options: OpenOptions, is_block: bool) -> ImportResult<Self> {
        let file = options
            .open(path)
            .map_err(|e| ImportError::from_io(format!("could not open file {}", path.display()), e))?;
        let writer = file
            .try_clone()
            .map(BufWriter::new)
            .map_err(|e| ImportError::from_io(format!("clone handle {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            writer,
            is_block,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn punch_hole(&self, offset: u64, length: u64) -> std::io::Result<()> {
        tracing::info!("Punching {}-byte hole at offset {}", length, offset);
        punch_hole(&self.file, offset, length)
    }

}

#[cfg(target_os = "linux")]
pub(crate) fn punch_hole(file: &File, offset: u64, length: u64) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn punch_hole(_file: &File, _offset: u64, _length: u64) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

impl DataSink for StreamingSink {
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> ImportResult<usize> {
        self.file.write_all_at(buf, offset).map_err(|e| {
            tracing::error!("Buffer write error at offset {}: {}", offset, e);
            ImportError::from_io(format!("write {}", self.path.display()), e)
        })?;
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> ImportResult<usize> {
        self.writer
            .write_all(buf)
            .and_then(|_| self.writer.flush())
            .map_err(|e| ImportError::from_io(format!("write {}", self.path.display()), e))?;
        Ok(buf.len())
    }

    fn zero_range(&mut self, offset: u64, length: u64) -> ImportResult<()> {
        let result = if self.is_block {
            self.punch_hole(offset, length)
        } else {
            match self.file.metadata() {
                Ok(meta) if offset + length > meta.len() => self.file.set_len(offset + length),
                Ok(_) => self.punch_hole(offset, length),
                Err(e) => {
                    tracing::error!("Unable to stat destination file: {}", e);
                    Err(e)
                }
            }
        };

        if let Err(e) = result {
            tracing::error!(
                "Unable to zero range {} - {} on destination, falling back to pwrite: {}",
                offset,
                offset + length,
                e
            );
            fill_zeroes(self, offset, length)?;
        }
        Ok(())
    }

    fn close(&mut self) -> ImportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .flush()
            .and_then(|_| self.file.sync_all())
            .map_err(|e| ImportError::from_io(format!("sync {}", self.path.display()), e))
    }
}

impl Drop for StreamingSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close {}: {}", self.path.display(), e);
        }
    }
}
