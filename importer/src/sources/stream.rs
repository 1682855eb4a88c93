//! Source over a single sequential byte stream.
//!
//! HTTP, S3, GCS and push uploads all hand over one stream of bytes; this
//! type peels it with [`FormatReaders`] and writes the payload out.

use std::io;
use std::path::Path;

use importer_shared::{ImportError, ImportLayout, ImportResult};

use super::DataSource;
use crate::options::ContentType;
use crate::phase::ProcessingPhase;
use crate::processor::available_space;
use crate::progress::{ProgressCounter, ProgressReader, ProgressTicker, ReadCount, start_ticker};
use crate::readers::{BoxedReader, ChecksumValidator, FormatReaders};
use crate::sink::{is_block_device, stream_data_to_file};
use crate::util::{clean_all, unarchive_tar};

/// [`DataSource`] over a sequential stream.
pub struct StreamSource {
    raw: Option<BoxedReader>,
    readers: Option<FormatReaders>,
    count: ReadCount,
    total: u64,
    counter: Option<ProgressCounter>,
    ticker: Option<ProgressTicker>,
    content_type: ContentType,
    preallocation: bool,
    checksum: Option<ChecksumValidator>,
    /// URL the converter can read from directly, skipping scratch space
    direct_url: Option<String>,
    url: Option<String>,
}

impl StreamSource {
    /// Wrap `stream`. `total` is the expected stream length, 0 if unknown.
    pub fn new(stream: BoxedReader, total: u64, content_type: ContentType) -> Self {
        let counted = ProgressReader::new(stream, total, None);
        let count = counted.count();
        Self {
            raw: Some(Box::new(counted)),
            readers: None,
            count,
            total,
            counter: None,
            ticker: None,
            content_type,
            preallocation: false,
            checksum: None,
            direct_url: None,
            url: None,
        }
    }

    pub fn with_progress(mut self, counter: Option<ProgressCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_preallocation(mut self, preallocation: bool) -> Self {
        self.preallocation = preallocation;
        self
    }

    /// Hash every byte of the stream and verify it once the transfer is done.
    pub fn with_checksum(mut self, checksum: Option<ChecksumValidator>) -> Self {
        if let Some(validator) = &checksum
            && let Some(raw) = self.raw.take()
        {
            self.raw = Some(Box::new(validator.reader(raw)));
        }
        self.checksum = checksum;
        self
    }

    /// Let `info` send convertible images straight to the converter at `url`.
    pub fn with_direct_url(mut self, url: Option<String>) -> Self {
        self.direct_url = url;
        self
    }

    /// Bytes taken from the underlying stream so far.
    pub fn count(&self) -> ReadCount {
        self.count.clone()
    }

    pub fn readers(&self) -> Option<&FormatReaders> {
        self.readers.as_ref()
    }

    fn readers_mut(&mut self) -> ImportResult<&mut FormatReaders> {
        self.readers
            .as_mut()
            .ok_or_else(|| ImportError::Internal("data source info has not run".into()))
    }

    fn start_progress(&mut self) {
        if let Some(counter) = self.counter.clone() {
            self.ticker = start_ticker(self.count.clone(), self.total, counter);
        }
    }

    /// Consume what is left of the stream, then check the checksum.
    fn finish(&mut self) -> ImportResult<()> {
        let readers = self.readers_mut()?;
        io::copy(readers.top_reader(), &mut io::sink())
            .map_err(|e| ImportError::from_io("unable to read source data", e))?;
        self.ticker = None;
        if let Some(counter) = &self.counter
            && self.total > 0
        {
            counter.advance_to(100.0);
        }
        match &self.checksum {
            Some(validator) => validator.validate(),
            None => Ok(()),
        }
    }
}

impl DataSource for StreamSource {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        let raw = self
            .raw
            .take()
            .ok_or_else(|| ImportError::Internal("data source stream already consumed".into()))?;
        let readers = FormatReaders::new(raw, self.content_type).inspect_err(|e| {
            tracing::error!("Error creating readers: {}", e);
        })?;
        let convert = readers.convert;
        self.readers = Some(readers);

        if self.content_type == ContentType::Archive {
            return Ok(ProcessingPhase::TransferDataDir);
        }
        if !convert {
            return Ok(ProcessingPhase::TransferDataFile);
        }
        match &self.direct_url {
            Some(url) if self.checksum.is_none() => {
                self.url = Some(url.clone());
                Ok(ProcessingPhase::Convert)
            }
            _ => Ok(ProcessingPhase::TransferScratch),
        }
    }

    fn transfer(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        match self.content_type {
            ContentType::Kubevirt => {
                if available_space(path).unwrap_or(0) == 0 {
                    return Err(ImportError::InvalidPath);
                }
                let file = ImportLayout::scratch_image(path);
                clean_all(&file)?;
                self.start_progress();
                let readers = self.readers_mut()?;
                stream_data_to_file(readers.top_reader(), &file, false)?;
                self.finish()?;
                self.url = Some(file.to_string_lossy().into_owned());
                Ok(ProcessingPhase::Convert)
            }
            ContentType::Archive => {
                self.start_progress();
                let readers = self.readers_mut()?;
                unarchive_tar(readers.top_reader(), path)
                    .map_err(|e| e.context("unable to untar files from endpoint"))?;
                self.finish()?;
                self.url = None;
                Ok(ProcessingPhase::Complete)
            }
        }
    }

    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        if !is_block_device(path) {
            clean_all(path)?;
        }
        self.start_progress();
        let preallocation = self.preallocation;
        let readers = self.readers_mut()?;
        let (read, written) = stream_data_to_file(readers.top_reader(), path, preallocation)?;
        tracing::info!(read, written, "Wrote payload to {}", path.display());
        self.finish()?;
        Ok(ProcessingPhase::Resize)
    }

    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    fn close(&mut self) -> ImportResult<()> {
        self.ticker = None;
        self.raw = None;
        match self.readers.as_mut() {
            Some(readers) => readers.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressMetrics;
    use importer_shared::ErrorKind;
    use std::io::Write;
    use tempfile::TempDir;

    fn source(data: Vec<u8>, content_type: ContentType) -> StreamSource {
        let total = data.len() as u64;
        StreamSource::new(Box::new(io::Cursor::new(data)), total, content_type)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(data).expect("Should compress");
        encoder.finish().expect("Should finish gzip")
    }

    fn qcow2_header(virtual_size: u64) -> Vec<u8> {
        let mut header = vec![0u8; 2048];
        header[..4].copy_from_slice(b"QFI\xfb");
        header[4..8].copy_from_slice(&3u32.to_be_bytes());
        header[24..32].copy_from_slice(&virtual_size.to_be_bytes());
        header
    }

    #[test]
    fn test_raw_goes_to_data_file() {
        let dir = TempDir::new().expect("Should create temp dir");
        let data = vec![7u8; 100_000];
        let mut src = source(gzip(&data), ContentType::Kubevirt);
        assert_eq!(src.info().expect("Should inspect"), ProcessingPhase::TransferDataFile);

        let dest = dir.path().join("disk.img");
        assert_eq!(src.transfer_file(&dest).expect("Should transfer"), ProcessingPhase::Resize);
        assert_eq!(std::fs::read(&dest).expect("Should read back"), data);
        src.close().expect("Should close");
        src.close().expect("Second close should be fine");
    }

    #[test]
    fn test_qcow2_goes_through_scratch() {
        let dir = TempDir::new().expect("Should create temp dir");
        let mut src = source(qcow2_header(1 << 20), ContentType::Kubevirt);
        assert_eq!(src.info().expect("Should inspect"), ProcessingPhase::TransferScratch);
        assert_eq!(src.transfer(dir.path()).expect("Should transfer"), ProcessingPhase::Convert);
        let url = src.url().expect("Should have scratch URL");
        assert!(url.ends_with("tmpimage"));
        assert_eq!(std::fs::metadata(&url).expect("Should stat").len(), 2048);
    }

    #[test]
    fn test_direct_url_skips_scratch() {
        let mut src = source(qcow2_header(1 << 20), ContentType::Kubevirt)
            .with_direct_url(Some("http://x/cirros.qcow2".into()));
        assert_eq!(src.info().expect("Should inspect"), ProcessingPhase::Convert);
        assert_eq!(src.url().as_deref(), Some("http://x/cirros.qcow2"));
    }

    #[test]
    fn test_archive_unpacks_into_dir() {
        let dir = TempDir::new().expect("Should create temp dir");
        let mut builder = tar::Builder::new(Vec::new());
        let content = b"This is the actual content of the file\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "tar_content.txt", &content[..])
            .expect("Should append");
        let archive = builder.into_inner().expect("Should finish tar");

        let mut src = source(archive, ContentType::Archive);
        assert_eq!(src.info().expect("Should inspect"), ProcessingPhase::TransferDataDir);
        assert_eq!(src.transfer(dir.path()).expect("Should unpack"), ProcessingPhase::Complete);
        assert_eq!(
            std::fs::read(dir.path().join("tar_content.txt")).expect("Should read file"),
            content
        );
        assert!(src.url().is_none());
    }

    #[test]
    fn test_archive_requires_tar() {
        let mut src = source(vec![1u8; 4096], ContentType::Archive);
        assert_eq!(src.info().unwrap_err().kind(), ErrorKind::ArchiveExpectedNotTar);
    }

    #[test]
    fn test_checksum_verified_after_transfer() {
        let dir = TempDir::new().expect("Should create temp dir");
        let good = ChecksumValidator::parse("md5:5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap();
        let mut src = source(b"hello world".to_vec(), ContentType::Kubevirt).with_checksum(Some(good));
        src.info().expect("Should inspect");
        src.transfer_file(&dir.path().join("a.img"))
            .expect("Matching checksum should pass");

        let bad = ChecksumValidator::parse("md5:00000000000000000000000000000000").unwrap();
        let mut src = source(b"hello world".to_vec(), ContentType::Kubevirt).with_checksum(Some(bad));
        src.info().expect("Should inspect");
        let err = src.transfer_file(&dir.path().join("b.img")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }

    #[test]
    fn test_progress_reaches_hundred() {
        let dir = TempDir::new().expect("Should create temp dir");
        let metrics = ProgressMetrics::new();
        let mut src = source(vec![1u8; 64 * 1024], ContentType::Kubevirt)
            .with_progress(Some(metrics.counter("uid")));
        src.info().expect("Should inspect");
        src.transfer_file(&dir.path().join("disk.img")).expect("Should transfer");
        assert_eq!(metrics.get("uid"), Some(100.0));
    }
}
