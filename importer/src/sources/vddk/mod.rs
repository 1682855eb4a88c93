//! VMware disks copied through nbdkit's VDDK plugin.
//!
//! nbdkit exposes one VM disk (optionally as of a snapshot) on a local NBD
//! socket. Full copies walk the whole export; warm-migration deltas ask
//! vSphere which areas changed since the previous checkpoint and copy only
//! those. Holes and zero runs become sparse ranges in the destination.

pub mod copy;
mod nbd;
pub mod vmware;

use std::path::Path;
use std::sync::Arc;

use importer_shared::constants::transfer::{MAX_PREAD_LENGTH_ESX, MAX_PREAD_LENGTH_VC};
use importer_shared::{ImportError, ImportResult, TerminationMessage};

pub use copy::{BlockStatusData, copy_all, copy_extent, copy_range, get_block_status};
pub use nbd::{
    BASE_ALLOCATION, BlockDescriptor, NbdClient, NbdConnector, NbdOperations, STATE_HOLE, STATE_ZERO,
    SocketNbdConnector,
};
pub use vmware::{
    SoapVmwareClient, SoapVmwareConnector, VirtualDisk, VmwareClient, VmwareConnector, VmwareParams,
};

use super::{Adapters, Capabilities, CloseHandle, DataSource};
use crate::nbdkit::{Nbdkit, NbdkitConfig, VddkPluginArgs};
use crate::options::ImporterOptions;
use crate::phase::ProcessingPhase;
use crate::progress::{ProgressCounter, TransferProgress};
use crate::sink::{DataSink, StreamingSink};

const CONFIG_FILE_NAME: &str = "vddk-config-file";

/// One VMware disk served by nbdkit.
///
/// Phases: Info → TransferDataFile → Resize, or Complete for delta copies.
pub struct VddkSource {
    nbdkit: Nbdkit,
    handle: Box<dyn NbdOperations>,
    vmware: Arc<dyn VmwareConnector>,
    params: VmwareParams,
    backing_file: String,
    current_snapshot: String,
    previous_snapshot: String,
    size: u64,
    max_pread: usize,
    is_block: bool,
    counter: Option<ProgressCounter>,
    closed: bool,
}

impl VddkSource {
    pub fn new(options: &ImporterOptions, adapters: &Adapters) -> ImportResult<Self> {
        Self::with_nbdkit(options, adapters, NbdkitConfig::default())
    }

    /// Like [`VddkSource::new`] with explicit nbdkit settings.
    pub fn with_nbdkit(
        options: &ImporterOptions,
        adapters: &Adapters,
        config: NbdkitConfig,
    ) -> ImportResult<Self> {
        if !cfg!(all(feature = "vddk", target_arch = "x86_64")) {
            return Err(ImportError::Unsupported(
                "the VDDK source is only available on x86_64 builds with the vddk feature".into(),
            ));
        }

        let vddk = &options.vddk;
        if !vddk.previous_checkpoint.is_empty() && vddk.current_checkpoint.is_empty() {
            return Err(ImportError::InvalidArgument(
                "a previous checkpoint requires a current checkpoint".into(),
            ));
        }

        let params = VmwareParams {
            endpoint: options.endpoint.clone(),
            username: options.access_key.clone(),
            password: options.secret_key.clone(),
            thumbprint: vddk.thumbprint.clone(),
            uuid: vddk.uuid.clone(),
        };
        let mut client = adapters
            .vmware
            .connect(&params)
            .map_err(|e| e.context("Unable to log in to VMware"))?;

        let prepared = prepare(client.as_mut(), options);
        if let Err(e) = client.logout() {
            tracing::warn!("Unable to log out of VMware: {}", e);
        }
        let prepared = prepared?;

        let plugin_args = VddkPluginArgs {
            server: prepared.server,
            username: params.username.clone(),
            password: params.password.clone(),
            thumbprint: params.thumbprint.clone(),
            moref: prepared.moref,
            snapshot: prepared.snapshot,
            config_file: vddk.config_dir.as_ref().map(|dir| dir.join(CONFIG_FILE_NAME)),
        };
        let mut nbdkit = Nbdkit::new_vddk(config, &plugin_args)?;
        nbdkit
            .start(&prepared.disk_file_name)
            .map_err(|e| e.context("Unable to start nbdkit"))?;

        let handle = match adapters.nbd.connect(nbdkit.socket()) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(kill_err) = nbdkit.kill() {
                    tracing::warn!("Unable to stop nbdkit: {}", kill_err);
                }
                return Err(e.context("Unable to connect to nbdkit"));
            }
        };
        let size = handle.size();
        let max_pread = if prepared.is_vcenter {
            MAX_PREAD_LENGTH_VC
        } else {
            MAX_PREAD_LENGTH_ESX
        };
        tracing::info!(size, max_pread, disk = %prepared.disk_file_name, "Connected to nbdkit");

        Ok(Self {
            nbdkit,
            handle,
            vmware: adapters.vmware.clone(),
            params,
            backing_file: vddk.backing_file.clone(),
            current_snapshot: vddk.current_checkpoint.clone(),
            previous_snapshot: vddk.previous_checkpoint.clone(),
            size,
            max_pread,
            is_block: options.is_block_destination(),
            counter: adapters.counter(&options.owner_uid),
            closed: false,
        })
    }

    /// Size of the exported disk in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn is_delta(&self) -> bool {
        !self.previous_snapshot.is_empty()
    }

    /// Changed extents of the backing disk between the previous and current
    /// checkpoints, as `(offset, length)`.
    fn changed_extents(&self) -> ImportResult<Vec<(u64, u64)>> {
        let mut client = self
            .vmware
            .connect(&self.params)
            .map_err(|e| e.context("Unable to log in to VMware"))?;
        let result = query_changes(
            client.as_mut(),
            &self.backing_file,
            &self.previous_snapshot,
            &self.current_snapshot,
        );
        if let Err(e) = client.logout() {
            tracing::warn!("Unable to log out of VMware: {}", e);
        }
        let areas = result.map_err(|e| e.context("Unable to query changed areas"))?;
        Ok(areas
            .into_iter()
            .filter(|a| a.start >= 0 && a.length > 0)
            .map(|a| (a.start as u64, a.length as u64))
            .collect())
    }

    fn copy_into(&mut self, sink: &mut dyn DataSink) -> ImportResult<ProcessingPhase> {
        let mut progress = TransferProgress::new(self.size, self.counter.clone());
        if self.is_delta() {
            let extents = self.changed_extents()?;
            if extents.is_empty() {
                tracing::info!(
                    "No changes reported between snapshot {} and snapshot {}, marking transfer complete.",
                    self.previous_snapshot,
                    self.current_snapshot
                );
                return Ok(ProcessingPhase::Complete);
            }
            tracing::info!("Copying {} changed areas", extents.len());
            for (start, length) in extents {
                copy_extent(self.handle.as_mut(), sink, start, length, self.max_pread, &mut progress)?;
            }
            return Ok(ProcessingPhase::Complete);
        }

        copy_all(self.handle.as_mut(), sink, self.size, self.max_pread, &mut progress)?;
        Ok(ProcessingPhase::Resize)
    }
}

fn query_changes(
    client: &mut dyn VmwareClient,
    backing_file: &str,
    previous: &str,
    current: &str,
) -> ImportResult<Vec<vmware::DiskChangeExtent>> {
    let disk = vmware::find_disk_from_name(client, backing_file)?;
    let current = vmware::find_snapshot(client, current)?;
    let snapshot_disk = vmware::find_snapshot_disk(client, &current, &disk.disk_object_id)?;
    vmware::changed_disk_areas(client, previous, &current, &snapshot_disk)
}

/// What the VMware session tells us before nbdkit starts.
struct Prepared {
    server: String,
    moref: String,
    snapshot: Option<String>,
    disk_file_name: String,
    is_vcenter: bool,
}

fn prepare(client: &mut dyn VmwareClient, options: &ImporterOptions) -> ImportResult<Prepared> {
    let vddk = &options.vddk;
    let disk = vmware::find_disk_from_name(client, &vddk.backing_file)?;

    let mut disk_file_name = disk.file_name.clone();
    let snapshot = if vddk.current_checkpoint.is_empty() {
        None
    } else {
        let snapshot = vmware::find_snapshot(client, &vddk.current_checkpoint)?;
        disk_file_name = vmware::find_snapshot_disk(client, &snapshot, &disk.disk_object_id)?.file_name;
        Some(snapshot)
    };
    tracing::info!("Disk file name for nbdkit: {}", disk_file_name);

    Ok(Prepared {
        server: client.server().to_string(),
        moref: client.moref().to_string(),
        snapshot,
        disk_file_name,
        is_vcenter: client.is_vcenter(),
    })
}

impl DataSource for VddkSource {
    fn info(&mut self) -> ImportResult<ProcessingPhase> {
        tracing::info!("Data size: {}", self.size);
        Ok(ProcessingPhase::TransferDataFile)
    }

    fn transfer(&mut self, _path: &Path) -> ImportResult<ProcessingPhase> {
        Ok(ProcessingPhase::TransferDataFile)
    }

    fn transfer_file(&mut self, path: &Path) -> ImportResult<ProcessingPhase> {
        let mut sink = if self.is_delta() {
            StreamingSink::reopen(path, self.is_block)?
        } else {
            StreamingSink::create(path, self.is_block)?
        };
        let phase = self.copy_into(&mut sink);
        let closed = sink.close();
        let phase = phase?;
        closed?;
        Ok(phase)
    }

    fn url(&self) -> Option<String> {
        Some(format!("nbd+unix:///?socket={}", self.nbdkit.socket().display()))
    }

    fn close(&mut self) -> ImportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.handle.close() {
            tracing::warn!("Unable to close NBD connection: {}", e);
        }
        self.nbdkit.kill()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            produces_termination_info: true,
            ..Capabilities::default()
        }
    }

    fn termination_message(&self) -> Option<TerminationMessage> {
        Some(TerminationMessage {
            vddk_info: Some(self.nbdkit.vddk_info()),
            ..TerminationMessage::default()
        })
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        let stopper = self.nbdkit.stopper();
        Some(CloseHandle::new(move || stopper.stop()))
    }
}

#[cfg(all(test, feature = "vddk", target_arch = "x86_64"))]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::fs::MetadataExt;
    use std::time::Duration;

    use importer_test_utils::nbd::{Extent, FakeNbdServer, write_fake_nbdkit};
    use tempfile::TempDir;

    use super::vmware::testing::{FakeVm, FakeVmware, disk, snapshot};
    use super::vmware::{DiskChangeExtent, DiskChangeInfo};
    use super::*;
    use crate::progress::ProgressMetrics;
    use crate::sources::SourceScheme;

    const MIB: u64 = 1 << 20;
    const BACKING: &str = "[datastore1] vm/vm.vmdk";

    // ====================================================================
    // Fixtures
    // ====================================================================

    struct TestContext {
        dir: TempDir,
        server: FakeNbdServer,
        vmware: FakeVmware,
    }

    impl TestContext {
        fn new(data: Vec<u8>, extents: Vec<Extent>, vm: Option<FakeVm>) -> Self {
            let server = FakeNbdServer::start(data, extents).expect("Should start NBD server");
            Self {
                dir: TempDir::new().expect("Should create temp dir"),
                server,
                vmware: FakeVmware {
                    vm,
                    ..Default::default()
                },
            }
        }

        fn adapters(&self) -> Adapters {
            let mut adapters = Adapters::system(ProgressMetrics::new(), "");
            adapters.vmware = Arc::new(self.vmware.clone());
            adapters
        }

        fn config(&self) -> NbdkitConfig {
            NbdkitConfig {
                binary: write_fake_nbdkit(self.dir.path()).expect("Should write nbdkit"),
                plugin: "vddk".into(),
                lib_dir: self.dir.path().join("vddk"),
                library_path: self.dir.path().join("vddk/lib64"),
                socket: self.server.socket().to_path_buf(),
                pid_file: self.dir.path().join("nbdkit.pid"),
                pid_poll_interval: Duration::from_millis(20),
                start_timeout: Duration::from_secs(5),
                max_log_lines: 100,
            }
        }

        fn source(&self, options: &ImporterOptions) -> ImportResult<VddkSource> {
            VddkSource::with_nbdkit(options, &self.adapters(), self.config())
        }

        fn destination(&self) -> std::path::PathBuf {
            self.dir.path().join("disk.img")
        }
    }

    fn vm() -> FakeVm {
        let mut snapshot_disks = HashMap::new();
        snapshot_disks.insert(
            "snapshot-1".to_string(),
            vec![disk_with_change(2000, "[datastore1] vm/vm-000001.vmdk", "52 aa-bb/1")],
        );
        snapshot_disks.insert(
            "snapshot-2".to_string(),
            vec![disk_with_change(2000, "[datastore1] vm/vm-000002.vmdk", "52 aa-bb/2")],
        );
        FakeVm {
            disks: vec![disk(2000, BACKING, "disk-1")],
            snapshot_disks,
            snapshots: vec![snapshot(
                "snapshot-1",
                "first",
                vec![snapshot("snapshot-2", "second", vec![])],
            )],
            pages: Vec::new(),
            vcenter: true,
        }
    }

    fn disk_with_change(key: i32, file: &str, change_id: &str) -> VirtualDisk {
        VirtualDisk {
            change_id: Some(change_id.into()),
            ..disk(key, file, "disk-1")
        }
    }

    fn options() -> ImporterOptions {
        let mut options = ImporterOptions::new(SourceScheme::Vddk, "https://vcenter.example.com/sdk");
        options.access_key = "admin".into();
        options.secret_key = "secret".into();
        options.vddk.uuid = "42 00 aa".into();
        options.vddk.backing_file = BACKING.into();
        options
    }

    /// 4 MiB disk: 1 MiB of data followed by 3 MiB of holes.
    fn sparse_disk() -> (Vec<u8>, Vec<Extent>) {
        let mut data = vec![0u8; 4 * MIB as usize];
        data[..MIB as usize].fill(0xab);
        let extents = vec![
            Extent { length: MIB, flags: 0 },
            Extent { length: 3 * MIB, flags: STATE_HOLE | STATE_ZERO },
        ];
        (data, extents)
    }

    // ====================================================================
    // Construction
    // ====================================================================

    #[test]
    fn test_previous_without_current_is_rejected() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data, extents, Some(vm()));
        let mut options = options();
        options.vddk.previous_checkpoint = "snapshot-1".into();

        let err = ctx.source(&options).err().expect("Should reject checkpoints");
        assert_eq!(err.kind(), importer_shared::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_missing_vm() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data, extents, None);

        let err = ctx.source(&options()).err().expect("Should fail without VM");
        assert!(matches!(err, ImportError::VmNotFound(_)), "{:?}", err);
    }

    #[test]
    fn test_missing_disk_logs_out() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data, extents, Some(vm()));
        let mut options = options();
        options.vddk.backing_file = "[datastore1] other/other.vmdk".into();

        let err = ctx.source(&options).err().expect("Should fail without disk");
        assert!(matches!(err, ImportError::DiskNotFound(_)), "{:?}", err);
        assert_eq!(*ctx.vmware.logouts.lock(), 1);
    }

    // ====================================================================
    // Copies
    // ====================================================================

    #[test]
    fn test_full_copy_is_sparse() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data.clone(), extents, Some(vm()));
        let mut source = ctx.source(&options()).expect("Should create source");

        assert_eq!(source.size(), 4 * MIB);
        assert_eq!(source.info().unwrap(), ProcessingPhase::TransferDataFile);
        assert_eq!(
            source.transfer(ctx.dir.path()).unwrap(),
            ProcessingPhase::TransferDataFile
        );

        let dest = ctx.destination();
        let phase = source.transfer_file(&dest).expect("Should copy");
        assert_eq!(phase, ProcessingPhase::Resize);

        let written = std::fs::read(&dest).expect("Should read destination");
        assert_eq!(written, data);
        let allocated = std::fs::metadata(&dest).unwrap().blocks() * 512;
        assert!(allocated < 4 * MIB, "allocated {} bytes", allocated);

        source.close().expect("Should close");
        source.close().expect("Close should be idempotent");

        let message = source.termination_message().expect("Should have message");
        let info = message.vddk_info.expect("Should have VDDK info");
        assert_eq!(info.version, "7.0.3");
        assert_eq!(info.host, "esx1.example.com");
    }

    #[test]
    fn test_full_copy_replaces_stale_destination() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data.clone(), extents, Some(vm()));
        std::fs::write(ctx.destination(), vec![0xffu8; 8 * MIB as usize]).unwrap();

        let mut source = ctx.source(&options()).expect("Should create source");
        source.transfer_file(&ctx.destination()).expect("Should copy");
        assert_eq!(std::fs::read(ctx.destination()).unwrap(), data);
    }

    #[test]
    fn test_delta_without_changes_is_complete() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data, extents, Some(vm()));
        let mut options = options();
        options.vddk.current_checkpoint = "second".into();
        options.vddk.previous_checkpoint = "first".into();
        std::fs::write(ctx.destination(), b"previous stage").unwrap();

        let mut source = ctx.source(&options).expect("Should create source");
        let phase = source.transfer_file(&ctx.destination()).expect("Should run delta");

        assert_eq!(phase, ProcessingPhase::Complete);
        assert_eq!(std::fs::read(ctx.destination()).unwrap(), b"previous stage");
        let queries = ctx.vmware.queries.lock();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0], ("snapshot-2".to_string(), 2000, 0, "52 aa-bb/1".to_string()));
    }

    #[test]
    fn test_delta_copies_changed_areas_only() {
        let (data, extents) = sparse_disk();
        let mut vm = vm();
        vm.pages = vec![DiskChangeInfo {
            start_offset: 0,
            length: 8 * MIB as i64,
            changed_area: vec![DiskChangeExtent { start: 0, length: 64 * 1024 }],
        }];
        let ctx = TestContext::new(data.clone(), extents, Some(vm));
        let mut options = options();
        options.vddk.current_checkpoint = "snapshot-2".into();
        options.vddk.previous_checkpoint = "52 aa-bb/1".into();
        std::fs::write(ctx.destination(), vec![0u8; 4 * MIB as usize]).unwrap();

        let mut source = ctx.source(&options).expect("Should create source");
        let phase = source.transfer_file(&ctx.destination()).expect("Should run delta");

        assert_eq!(phase, ProcessingPhase::Complete);
        let written = std::fs::read(ctx.destination()).unwrap();
        assert_eq!(&written[..64 * 1024], &data[..64 * 1024]);
        assert!(written[64 * 1024..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_delta_requires_destination() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data, extents, Some(vm()));
        let mut options = options();
        options.vddk.current_checkpoint = "second".into();
        options.vddk.previous_checkpoint = "first".into();

        let mut source = ctx.source(&options).expect("Should create source");
        let err = source.transfer_file(&ctx.destination()).unwrap_err();
        assert_eq!(err.kind(), importer_shared::ErrorKind::Storage);
    }

    #[test]
    fn test_url_names_socket() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data, extents, Some(vm()));
        let source = ctx.source(&options()).expect("Should create source");
        let url = source.url().expect("Should have URL");
        assert!(url.starts_with("nbd+unix:///?socket="));
        assert!(url.ends_with(&ctx.server.socket().display().to_string()));
        assert!(source.capabilities().produces_termination_info);
    }

    #[test]
    fn test_close_handle_stops_nbdkit_from_another_thread() {
        let (data, extents) = sparse_disk();
        let ctx = TestContext::new(data, extents, Some(vm()));
        let mut source = ctx.source(&options()).expect("Should create source");
        let pid_file = ctx.dir.path().join("nbdkit.pid");
        assert!(pid_file.exists());

        let handle = source.close_handle().expect("Should have a close handle");
        std::thread::spawn(move || {
            handle.close();
            handle.close();
        })
        .join()
        .expect("Should join closer thread");
        assert!(!pid_file.exists());

        source.close().expect("Should close after interrupt");
    }
}
