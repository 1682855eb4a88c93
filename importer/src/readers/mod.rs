//! Format-reader stack.
//!
//! [`FormatReaders`] peels container layers off a raw input stream until it
//! reaches the payload. Each detection step reads a header, then pushes a
//! replay layer that serves those bytes again before falling through to the
//! layer below, so the next reader sees an untouched stream:
//!
//! ```text
//! stream ─> replay(hdr) ─> gz ─> replay(hdr) ─> tar entry ─> replay(hdr)
//!                                                            ^ top reader
//! ```

pub mod checksum;
mod tar_entry;

use std::io::{self, Read};

use importer_shared::constants::transfer::MAX_EXPECTED_HDR_SIZE;
use importer_shared::{ImportError, ImportResult};

use crate::format::header::{Header, HeaderFormat, KNOWN_HEADERS, match_header};
use crate::format::iso;
use crate::options::ContentType;

pub use checksum::{ChecksumReader, ChecksumValidator};
use tar_entry::TarEntryReader;

/// Boxed reader type carried through the stack.
pub type BoxedReader = Box<dyn Read + Send>;

/// What a layer of the stack does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderKind {
    Stream,
    Multi,
    Gz,
    Tar,
    Xz,
}

/// Replays a buffered header before reading on from the layer below.
struct Replay {
    buf: Vec<u8>,
    pos: usize,
    inner: BoxedReader,
}

impl Read for Replay {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.buf.len() {
            let n = out.len().min(self.buf.len() - self.pos);
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.inner.read(out)
    }
}

/// Stack of readers peeling an input stream down to its payload.
pub struct FormatReaders {
    kinds: Vec<ReaderKind>,
    top: BoxedReader,
    content_type: ContentType,

    /// The payload was unwrapped from gz, xz or tar.
    pub archived: bool,
    /// The payload needs `qemu-img convert` (qcow2, ISO).
    pub convert: bool,
    /// A compression layer was seen.
    pub compressed: bool,
    /// A tar header was seen.
    pub archive_tar: bool,
    /// Payload size when a header declared it, else 0.
    pub size: u64,
}

impl FormatReaders {
    /// Build the stack over `stream`, detecting every container layer.
    ///
    /// An unrecognised payload is treated as raw. Archive content must contain
    /// a tar layer.
    pub fn new(stream: BoxedReader, content_type: ContentType) -> ImportResult<Self> {
        let mut readers = Self {
            kinds: vec![ReaderKind::Stream],
            top: stream,
            content_type,
            archived: false,
            convert: false,
            compressed: false,
            archive_tar: false,
            size: 0,
        };
        readers.construct()?;
        Ok(readers)
    }

    fn construct(&mut self) -> ImportResult<()> {
        tracing::debug!("Checking compression and archive formats");
        let mut candidates: Vec<Header> = KNOWN_HEADERS.to_vec();

        loop {
            let buf = self
                .read_header(MAX_EXPECTED_HDR_SIZE)
                .map_err(|e| ImportError::from_io("could not process image header", e))?;
            let Some(header) = match_header(&buf, &candidates) else {
                break;
            };
            candidates.retain(|h| h.format != header.format);
            tracing::debug!("Found header of type {}", header.format);

            self.select_format(&header, &buf)?;
            if header.format == HeaderFormat::Qcow2 {
                break;
            }
        }

        if self.content_type == ContentType::Archive {
            if !self.archive_tar {
                return Err(ImportError::ArchiveExpectedNotTar);
            }
            return Ok(());
        }

        if self.size == 0 {
            let buf = self
                .read_header(iso::ISO_PROBE_LEN)
                .map_err(|e| ImportError::from_io("unable to calculate RAW file size", e))?;
            self.size = iso::raw_size(&buf);
            if self.size != 0 {
                tracing::debug!(size = self.size, "Payload is an ISO image");
                self.convert = true;
            }
        }
        Ok(())
    }

    /// Read up to `len` bytes from the top reader and push a replay layer
    /// that serves them again.
    fn read_header(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        (&mut self.top).take(len as u64).read_to_end(&mut buf)?;
        let inner = std::mem::replace(&mut self.top, Box::new(io::empty()));
        self.push(
            ReaderKind::Multi,
            Box::new(Replay {
                buf: buf.clone(),
                pos: 0,
                inner,
            }),
        );
        Ok(buf)
    }

    fn push(&mut self, kind: ReaderKind, reader: BoxedReader) {
        self.kinds.push(kind);
        self.top = reader;
    }

    fn take_top(&mut self) -> BoxedReader {
        std::mem::replace(&mut self.top, Box::new(io::empty()))
    }

    fn select_format(&mut self, header: &Header, buf: &[u8]) -> ImportResult<()> {
        match header.format {
            HeaderFormat::Gz => {
                let inner = self.take_top();
                self.push(ReaderKind::Gz, Box::new(flate2::read::MultiGzDecoder::new(inner)));
                self.archived = true;
                self.compressed = true;
                self.size = 0;
            }
            HeaderFormat::Xz => {
                let inner = self.take_top();
                self.push(ReaderKind::Xz, Box::new(xz2::read::XzDecoder::new(inner)));
                self.archived = true;
                self.compressed = true;
                self.size = 0;
            }
            HeaderFormat::Tar => {
                self.archive_tar = true;
                self.archived = true;
                // Archives are unpacked whole by the caller.
                if self.content_type == ContentType::Archive {
                    self.size = 0;
                    return Ok(());
                }
                let inner = self.take_top();
                let entry = TarEntryReader::open(inner)
                    .map_err(|e| ImportError::from_io("could not read tar header", e))?;
                tracing::debug!("tar: extracting {:?}", entry.name());
                self.size = entry.size();
                self.push(ReaderKind::Tar, Box::new(entry));
            }
            HeaderFormat::Qcow2 => {
                self.size = header.size(buf).unwrap_or(0);
                self.convert = true;
            }
        }
        Ok(())
    }

    /// The reader all higher layers must read the payload through.
    pub fn top_reader(&mut self) -> &mut (dyn Read + Send) {
        self.top.as_mut()
    }

    /// Take ownership of the top reader, leaving the stack closed.
    pub fn into_top_reader(mut self) -> BoxedReader {
        self.kinds.clear();
        self.take_top()
    }

    /// Layer kinds in push order.
    pub fn kinds(&self) -> &[ReaderKind] {
        &self.kinds
    }

    /// Release every layer, outermost first.
    pub fn close(&mut self) -> ImportResult<()> {
        // Dropping the top layer drops each wrapped layer after it.
        drop(self.take_top());
        self.kinds.clear();
        Ok(())
    }
}

impl Read for FormatReaders {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.top.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use importer_shared::ErrorKind;
    use std::io::Write;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(data).expect("Should compress");
        enc.finish().expect("Should finish gzip")
    }

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 1);
        enc.write_all(data).expect("Should compress");
        enc.finish().expect("Should finish xz")
    }

    fn tar(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data)
            .expect("Should append tar entry");
        builder.into_inner().expect("Should finish tar")
    }

    fn open(bytes: Vec<u8>, content_type: ContentType) -> ImportResult<FormatReaders> {
        FormatReaders::new(Box::new(io::Cursor::new(bytes)), content_type)
    }

    fn read_all(readers: &mut FormatReaders) -> Vec<u8> {
        let mut out = Vec::new();
        readers.top_reader().read_to_end(&mut out).expect("Should read payload");
        out
    }

    #[test]
    fn test_raw_passthrough() {
        let data = payload(5000);
        let mut readers = open(data.clone(), ContentType::Kubevirt).expect("Should build readers");
        assert!(!readers.archived && !readers.convert);
        assert_eq!(readers.size, 0);
        assert_eq!(read_all(&mut readers), data);
    }

    #[test]
    fn test_short_stream_is_raw() {
        let mut readers = open(b"tiny".to_vec(), ContentType::Kubevirt).expect("Should build");
        assert_eq!(read_all(&mut readers), b"tiny");
    }

    #[test]
    fn test_gz_and_xz_are_peeled() {
        let data = payload(70_000);
        for (wrapped, kind) in [(gz(&data), ReaderKind::Gz), (xz(&data), ReaderKind::Xz)] {
            let mut readers = open(wrapped, ContentType::Kubevirt).expect("Should build readers");
            assert!(readers.archived);
            assert!(readers.compressed);
            assert!(readers.kinds().contains(&kind));
            assert_eq!(read_all(&mut readers), data);
        }
    }

    #[test]
    fn test_tar_gz_reports_member_size() {
        let data = payload(3000);
        let mut readers =
            open(gz(&tar("disk.img", &data)), ContentType::Kubevirt).expect("Should build readers");
        assert!(readers.archive_tar);
        assert_eq!(readers.size, 3000);
        assert_eq!(read_all(&mut readers), data);
    }

    #[test]
    fn test_qcow2_sets_convert_and_size() {
        let mut image = vec![0u8; 4096];
        image[0..4].copy_from_slice(b"QFI\xfb");
        image[24..32].copy_from_slice(&(10u64 << 20).to_be_bytes());
        let mut readers = open(gz(&image), ContentType::Kubevirt).expect("Should build readers");
        assert!(readers.convert);
        assert_eq!(readers.size, 10 << 20);
        assert_eq!(read_all(&mut readers), image);
    }

    #[test]
    fn test_iso_detection() {
        let mut image = vec![0u8; 64 * 2048];
        let vd = iso::PRIMARY_VD_OFFSET;
        image[vd] = 1;
        image[vd + 1..vd + 6].copy_from_slice(b"CD001");
        image[vd + 84..vd + 88].copy_from_slice(&64u32.to_be_bytes());
        image[vd + 130..vd + 132].copy_from_slice(&2048u16.to_be_bytes());

        let mut readers = open(image.clone(), ContentType::Kubevirt).expect("Should build");
        assert!(readers.convert);
        assert_eq!(readers.size, 64 * 2048);
        assert_eq!(read_all(&mut readers), image);
    }

    #[test]
    fn test_archive_requires_tar() {
        let mut qcow = vec![0u8; 2048];
        qcow[0..4].copy_from_slice(b"QFI\xfb");
        let err = open(qcow, ContentType::Archive).err().expect("Should reject qcow2");
        assert_eq!(err.kind(), ErrorKind::ArchiveExpectedNotTar);

        let archive = tar("tar_content.txt", b"This is the actual content of the file\n");
        let mut readers = open(archive.clone(), ContentType::Archive).expect("Should accept tar");
        assert!(readers.archived && readers.archive_tar);
        assert_eq!(read_all(&mut readers), archive);
    }

    #[test]
    fn test_close_is_repeatable() {
        let mut readers = open(payload(10), ContentType::Kubevirt).expect("Should build");
        readers.close().expect("First close should succeed");
        readers.close().expect("Second close should succeed");
        assert!(read_all(&mut readers).is_empty());
    }

    // ========================================================================
    // PROPERTIES
    // ========================================================================

    mod prop {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Copy, Debug)]
        enum Wrapper {
            Plain,
            Gz,
            Xz,
            Tar,
            TarGz,
            TarXz,
        }

        fn wrap(wrapper: Wrapper, data: &[u8]) -> Vec<u8> {
            match wrapper {
                Wrapper::Plain => data.to_vec(),
                Wrapper::Gz => gz(data),
                Wrapper::Xz => xz(data),
                Wrapper::Tar => tar("disk.img", data),
                Wrapper::TarGz => gz(&tar("disk.img", data)),
                Wrapper::TarXz => xz(&tar("disk.img", data)),
            }
        }

        fn wrapper() -> impl Strategy<Value = Wrapper> {
            prop_oneof![
                Just(Wrapper::Plain),
                Just(Wrapper::Gz),
                Just(Wrapper::Xz),
                Just(Wrapper::Tar),
                Just(Wrapper::TarGz),
                Just(Wrapper::TarXz),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_peeling_is_transparent(
                body in proptest::collection::vec(any::<u8>(), 1..20_000),
                wrapper in wrapper(),
            ) {
                // A leading zero keeps random bytes from looking like a magic number.
                let mut data = vec![0u8];
                data.extend_from_slice(&body);

                let mut readers = open(wrap(wrapper, &data), ContentType::Kubevirt)
                    .expect("Should build readers");
                prop_assert!(!readers.convert);
                prop_assert_eq!(read_all(&mut readers), data);
            }
        }
    }
}
