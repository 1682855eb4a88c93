//! Reader over the first regular file of a tar stream.

use std::io::{self, Read};

use super::BoxedReader;

const BLOCK: usize = 512;

pub(super) struct TarEntryReader {
    inner: BoxedReader,
    name: String,
    size: u64,
    remaining: u64,
    drained: bool,
}

impl TarEntryReader {
    /// Advance `inner` to the first regular file and read only its data.
    ///
    /// Metadata entries (long names, pax headers, directories) are skipped.
    pub(super) fn open(mut inner: BoxedReader) -> io::Result<Self> {
        let mut long_name: Option<String> = None;
        loop {
            let mut block = [0u8; BLOCK];
            inner.read_exact(&mut block)?;
            if block.iter().all(|b| *b == 0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "tar archive holds no file",
                ));
            }

            let header = tar::Header::from_byte_slice(&block);
            let size = header.entry_size()?;
            let entry_type = header.entry_type();

            if entry_type.is_file() || entry_type.is_contiguous() {
                let name = match long_name.take() {
                    Some(name) => name,
                    None => header.path()?.to_string_lossy().into_owned(),
                };
                return Ok(Self {
                    inner,
                    name,
                    size,
                    remaining: size,
                    drained: false,
                });
            }

            let padded = size.div_ceil(BLOCK as u64) * BLOCK as u64;
            if entry_type.is_gnu_longname() {
                let mut data = Vec::with_capacity(padded as usize);
                (&mut inner).take(padded).read_to_end(&mut data)?;
                data.truncate(size as usize);
                let name = String::from_utf8_lossy(&data);
                long_name = Some(name.trim_end_matches('\0').to_string());
            } else {
                io::copy(&mut (&mut inner).take(padded), &mut io::sink())?;
            }
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn size(&self) -> u64 {
        self.size
    }
}

impl Read for TarEntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            // Consume the rest of the archive so wrapped layers reach EOF.
            if !self.drained {
                io::copy(&mut self.inner, &mut io::sink())?;
                self.drained = true;
            }
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar entry truncated",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_directories_and_long_names() {
        let long = format!("{}/disk.img", "d".repeat(120));
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder
            .append_data(&mut dir, "disk/", io::empty())
            .expect("Should append dir");

        let mut file = tar::Header::new_gnu();
        file.set_size(4);
        file.set_mode(0o644);
        builder
            .append_data(&mut file, &long, &b"data"[..])
            .expect("Should append file");
        let bytes = builder.into_inner().expect("Should finish tar");

        let mut entry =
            TarEntryReader::open(Box::new(io::Cursor::new(bytes))).expect("Should find file");
        assert_eq!(entry.name(), long);
        assert_eq!(entry.size(), 4);
        let mut out = Vec::new();
        entry.read_to_end(&mut out).expect("Should read entry");
        assert_eq!(out, b"data");
    }

    #[test]
    fn test_end_of_entry_consumes_archive() {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in [("disk.img", &b"first"[..]), ("other.img", &b"second"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, name, data)
                .expect("Should append file");
        }
        let bytes = builder.into_inner().expect("Should finish tar");
        let total = bytes.len() as u64;

        let counted = crate::progress::ProgressReader::new(io::Cursor::new(bytes), total, None);
        let count = counted.count();
        let mut entry = TarEntryReader::open(Box::new(counted)).expect("Should find file");
        let mut out = Vec::new();
        entry.read_to_end(&mut out).expect("Should read entry");
        assert_eq!(out, b"first");
        assert_eq!(count.current(), total);
    }

    #[test]
    fn test_empty_archive() {
        let bytes = tar::Builder::new(Vec::new())
            .into_inner()
            .expect("Should finish tar");
        assert!(TarEntryReader::open(Box::new(io::Cursor::new(bytes))).is_err());
    }
}
