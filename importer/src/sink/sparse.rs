use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use importer_shared::constants::transfer::SPARSE_BOUNDARY;
use importer_shared::{ImportError, ImportResult};

use super::is_block_device;

/// Extend `file` with zeroes from `start` to `start + length` by truncating.
///
/// Fails if the file already extends past `start`, since truncating would
/// then discard data.
pub fn append_zero_with_truncate(file: &File, start: u64, length: u64) -> io::Result<()> {
    let size = file.metadata()?.len();
    if size > start {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "cannot safely append {} zeroes to {}-byte file at offset {}",
                length, size, start
            ),
        ));
    }
    file.set_len(start + length)
}

type AppendZero = fn(&File, u64, u64) -> io::Result<()>;

/// Copy `reader` into the destination at `path`.
///
/// Without preallocation, all-zero ranges of [`SPARSE_BOUNDARY`] bytes
/// written to a regular file are appended by truncation instead of written,
/// leaving holes. Returns `(bytes_read, bytes_written)`.
pub fn stream_data_to_file(
    reader: &mut dyn Read,
    path: &Path,
    preallocate: bool,
) -> ImportResult<(u64, u64)> {
    stream_with(reader, path, preallocate, append_zero_with_truncate)
}

fn stream_with(
    reader: &mut dyn Read,
    path: &Path,
    preallocate: bool,
    append_zero: AppendZero,
) -> ImportResult<(u64, u64)> {
    let is_block = is_block_device(path);
    let mut options = OpenOptions::new();
    options.write(true);
    if is_block {
        options.custom_flags(libc::O_EXCL);
    } else {
        options.create_new(true).mode(0o660);
    }
    let file = options
        .open(path)
        .map_err(|e| ImportError::from_io(format!("could not open file {}", path.display()), e))?;

    tracing::debug!("Writing data...");
    let result = copy_sparse(reader, &file, !preallocate && !is_block, append_zero)
        .and_then(|counts| {
            file.sync_all()
                .map_err(|e| ImportError::from_io(format!("sync {}", path.display()), e))?;
            Ok(counts)
        });

    if let Err(e) = &result {
        tracing::error!("Unable to write file from data reader: {}", e);
        if !is_block {
            let _ = std::fs::remove_file(path);
        }
    }
    result
}

fn copy_sparse(
    reader: &mut dyn Read,
    file: &File,
    sparse: bool,
    append_zero: AppendZero,
) -> ImportResult<(u64, u64)> {
    let mut buf = vec![0u8; SPARSE_BOUNDARY];
    let mut offset = 0u64;
    let mut written = 0u64;

    loop {
        let n = read_full(reader, &mut buf)
            .map_err(|e| ImportError::from_io("unable to read source data", e))?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];

        let skipped = sparse
            && chunk.iter().all(|b| *b == 0)
            && match append_zero(file, offset, n as u64) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Falling back to writing zeroes: {}", e);
                    false
                }
            };
        if !skipped {
            file.write_all_at(chunk, offset)
                .map_err(|e| ImportError::from_io("unable to write to file", e))?;
            written += n as u64;
        }
        offset += n as u64;
    }
    Ok((offset, written))
}

fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    const B: usize = SPARSE_BOUNDARY;

    fn ranges(pattern: &[u8]) -> Vec<u8> {
        pattern.iter().flat_map(|b| vec![*b; B]).collect()
    }

    fn failing_append(_: &File, _: u64, _: u64) -> io::Result<()> {
        Err(io::Error::other("fake append with truncate"))
    }

    #[rstest]
    #[case::alternating(&[1, 0, 1, 0], false, 2)]
    #[case::alternating_with_failure(&[1, 0, 1, 0], true, 4)]
    #[case::leading(&[0, 1, 1, 1], false, 3)]
    #[case::trailing(&[1, 1, 1, 0], false, 3)]
    #[case::leading_with_failure(&[0, 1, 1, 1], true, 4)]
    #[case::trailing_with_failure(&[1, 1, 1, 0], true, 4)]
    fn test_zero_ranges(#[case] pattern: &[u8], #[case] fail: bool, #[case] expected: u64) {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("disk.img");
        let data = ranges(pattern);
        let append: AppendZero = if fail { failing_append } else { append_zero_with_truncate };

        let (read, written) = stream_with(&mut data.as_slice(), &path, false, append)
            .expect("Should stream data");
        assert_eq!(read, (B * 4) as u64);
        assert_eq!(written, expected * B as u64);
        assert_eq!(std::fs::read(&path).expect("Should read back"), data);
    }

    #[test]
    fn test_preallocation_writes_every_byte() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("disk.img");
        let data = ranges(&[0, 0, 1]);
        let (read, written) =
            stream_data_to_file(&mut data.as_slice(), &path, true).expect("Should stream data");
        assert_eq!(read, written);
        assert_eq!(std::fs::read(&path).expect("Should read back"), data);
    }

    #[test]
    fn test_existing_destination_is_rejected() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("disk.img");
        std::fs::write(&path, b"x").expect("Should create file");
        assert!(stream_data_to_file(&mut &b"data"[..], &path, false).is_err());
    }

    #[test]
    fn test_append_refuses_to_truncate_data() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("f");
        std::fs::write(&path, vec![1u8; 2048]).expect("Should create file");
        let file = OpenOptions::new().write(true).open(&path).expect("Should open");
        let err = append_zero_with_truncate(&file, 0, 1024).unwrap_err();
        assert!(err.to_string().contains("cannot safely append"));
    }

    #[test]
    fn test_short_final_range() {
        let dir = TempDir::new().expect("Should create temp dir");
        let path = dir.path().join("disk.img");
        let mut data = ranges(&[1]);
        data.extend(vec![0u8; 100]);
        let (read, written) =
            stream_data_to_file(&mut data.as_slice(), &path, false).expect("Should stream data");
        assert_eq!(read, (B + 100) as u64);
        assert_eq!(written, B as u64);
        assert_eq!(std::fs::metadata(&path).expect("Should stat").len(), read);
    }
}
