//! Shared fixtures for importer integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use importer::processor::ProcessorConfig;
use importer::{
    Adapters, DataProcessor, ImgInfo, ImportError, ImportLayout, ImportResult, ImporterOptions,
    ProgressMetrics, QemuOperations, SourceScheme,
};
use parking_lot::Mutex;
use tempfile::TempDir;

/// qemu-img stand-in. Conversion copies local files byte for byte.
#[derive(Default)]
pub struct FakeQemu {
    pub virtual_size: u64,
    pub calls: Mutex<Vec<String>>,
}

impl FakeQemu {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl QemuOperations for FakeQemu {
    fn info(&self, url: &str) -> ImportResult<ImgInfo> {
        self.calls.lock().push(format!("info {}", url));
        Ok(ImgInfo {
            format: "qcow2".into(),
            virtual_size: self.virtual_size,
            ..Default::default()
        })
    }

    fn convert_to_raw_stream(&self, url: &str, dest: &Path, preallocate: bool) -> ImportResult<()> {
        self.calls.lock().push(format!("convert {} {}", url, preallocate));
        std::fs::copy(url, dest).map_err(|e| ImportError::from_io("copy", e))?;
        Ok(())
    }

    fn resize(&self, _image: &Path, size: u64, preallocate: bool) -> ImportResult<()> {
        self.calls.lock().push(format!("resize {} {}", size, preallocate));
        Ok(())
    }

    fn create_blank_image(&self, dest: &Path, size: u64, preallocate: bool) -> ImportResult<()> {
        self.calls.lock().push(format!("create {} {}", size, preallocate));
        let file = std::fs::File::create(dest).map_err(|e| ImportError::from_io("create", e))?;
        file.set_len(size).map_err(|e| ImportError::from_io("truncate", e))
    }

    fn preallocate(&self, image: &Path) -> ImportResult<()> {
        self.calls.lock().push(format!("preallocate {}", image.display()));
        Ok(())
    }
}

/// Data and scratch directories under one temporary root.
pub struct TestContext {
    pub dir: TempDir,
    pub qemu: Arc<FakeQemu>,
}

impl TestContext {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Should create temp dir");
        std::fs::create_dir_all(dir.path().join("data")).expect("Should create data dir");
        std::fs::create_dir_all(dir.path().join("scratch")).expect("Should create scratch dir");
        Self {
            dir,
            qemu: Arc::new(FakeQemu {
                virtual_size: 1 << 20,
                ..Default::default()
            }),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn data_file(&self) -> PathBuf {
        self.data_dir().join("disk.img")
    }

    pub fn options(&self, source: SourceScheme, endpoint: &str) -> ImporterOptions {
        let mut options = ImporterOptions::new(source, endpoint);
        options.layout = ImportLayout::in_dir(self.data_dir()).with_scratch(self.dir.path().join("scratch"));
        options.proxy_cert_dir = None;
        options.extra_headers_dir = self.dir.path().join("no-headers");
        options.termination_message_path = self.dir.path().join("termination-log");
        options
    }

    pub fn adapters(&self) -> Adapters {
        let mut adapters = Adapters::system(ProgressMetrics::new(), "");
        adapters.qemu = self.qemu.clone();
        adapters
    }

    pub fn processor(&self, options: &ImporterOptions) -> ImportResult<DataProcessor> {
        let source = importer::build_source(options, &self.adapters(), None)?;
        DataProcessor::new(source, ProcessorConfig::from_options(options), self.qemu.clone())
    }
}
