//! vSphere API access for the VDDK source.
//!
//! [`VmwareClient`] is the narrow view of one VM the copier needs: its disks,
//! its snapshot tree and changed-block tracking. The lookups built on it
//! live here so they work the same against the SOAP client and test fakes.

mod soap;

use std::sync::LazyLock;

use importer_shared::{ImportError, ImportResult};
use regex::Regex;

pub use soap::{SoapVmwareClient, SoapVmwareConnector};

/// Change IDs look like `52 de c0 d9 b9 43 9d 10-61 d5 4c 1b e9 7b 65 63/81`.
static CHANGE_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-fA-F]{2}\s?)*-([0-9a-fA-F]{2}\s?)*/([0-9a-fA-F]*)").expect("valid change ID pattern")
});

/// Whether a checkpoint names a CBT change ID rather than a snapshot.
pub fn is_change_id(checkpoint: &str) -> bool {
    CHANGE_ID_PATTERN.is_match(checkpoint)
}

/// Where and as whom to log in.
#[derive(Clone, Debug, Default)]
pub struct VmwareParams {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// SHA-1 thumbprint of the endpoint certificate
    pub thumbprint: String,
    /// BIOS UUID of the VM
    pub uuid: String,
}

/// A virtual disk as the VM or a snapshot saw it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualDisk {
    /// Device key, stable across snapshots
    pub key: i32,
    /// Backing file, e.g. `[datastore1] vm/vm-000001.vmdk`
    pub file_name: String,
    /// Backing file of the parent disk, for delta disks
    pub parent_file_name: Option<String>,
    /// CBT change ID recorded with the backing
    pub change_id: Option<String>,
    pub capacity_in_bytes: i64,
    pub disk_object_id: String,
}

/// One node of the VM snapshot tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotTree {
    /// Managed object ID, e.g. `snapshot-12`
    pub moref: String,
    pub name: String,
    pub children: Vec<SnapshotTree>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskChangeExtent {
    pub start: i64,
    pub length: i64,
}

/// One page of `QueryChangedDiskAreas`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskChangeInfo {
    pub start_offset: i64,
    pub length: i64,
    pub changed_area: Vec<DiskChangeExtent>,
}

/// Logs in to vSphere and finds the VM.
pub trait VmwareConnector: Send + Sync {
    /// Fails with `VmNotFound` when no datacenter holds the VM.
    fn connect(&self, params: &VmwareParams) -> ImportResult<Box<dyn VmwareClient>>;
}

/// A logged-in session bound to one VM.
pub trait VmwareClient: Send {
    /// Managed object ID of the VM
    fn moref(&self) -> &str;

    /// Host name nbdkit should connect to
    fn server(&self) -> &str;

    /// The endpoint is vCenter rather than a standalone ESXi host.
    fn is_vcenter(&self) -> bool;

    /// Disks of the running VM, or of `snapshot` when given.
    fn disks(&mut self, snapshot: Option<&str>) -> ImportResult<Vec<VirtualDisk>>;

    /// Root snapshots of the VM; empty when it has none.
    fn snapshots(&mut self) -> ImportResult<Vec<SnapshotTree>>;

    fn query_changed_disk_areas(
        &mut self,
        snapshot: &str,
        device_key: i32,
        start_offset: i64,
        change_id: &str,
    ) -> ImportResult<DiskChangeInfo>;

    fn logout(&mut self) -> ImportResult<()>;
}

/// Find the disk backed by `file_name`, looking at the running VM first and
/// then at every snapshot.
pub fn find_disk_from_name(client: &mut dyn VmwareClient, file_name: &str) -> ImportResult<VirtualDisk> {
    if let Some(disk) = client.disks(None)?.into_iter().find(|d| d.file_name == file_name) {
        return Ok(disk);
    }

    let snapshots = client.snapshots()?;
    if snapshots.is_empty() {
        tracing::info!("No snapshots on this virtual machine.");
    } else {
        if let Some(disk) = find_disk_in_snapshot_tree(client, &snapshots, file_name) {
            return Ok(disk);
        }
        if let Some(disk) = find_disk_in_root_snapshot_parent(client, &snapshots, file_name) {
            return Ok(disk);
        }
    }

    Err(ImportError::DiskNotFound(format!(
        "disk '{}' is not present in VM hardware config or snapshot list",
        file_name
    )))
}

fn find_disk_in_snapshot_tree(
    client: &mut dyn VmwareClient,
    snapshots: &[SnapshotTree],
    file_name: &str,
) -> Option<VirtualDisk> {
    for snapshot in snapshots {
        match client.disks(Some(&snapshot.moref)) {
            Ok(disks) => {
                if let Some(disk) = disks.into_iter().find(|d| d.file_name == file_name) {
                    return Some(disk);
                }
            }
            Err(e) => tracing::error!("Unable to get snapshot properties: {}", e),
        }
        if let Some(disk) = find_disk_in_snapshot_tree(client, &snapshot.children, file_name) {
            return Some(disk);
        }
    }
    None
}

/// The first listed disk can be a delta whose parent is the file asked for.
fn find_disk_in_root_snapshot_parent(
    client: &mut dyn VmwareClient,
    snapshots: &[SnapshotTree],
    file_name: &str,
) -> Option<VirtualDisk> {
    let first = snapshots.first()?;
    let disks = client.disks(Some(&first.moref)).ok()?;
    disks
        .into_iter()
        .find(|d| d.parent_file_name.as_deref() == Some(file_name))
}

/// Resolve a snapshot by name or managed object ID.
pub fn find_snapshot(client: &mut dyn VmwareClient, name_or_ref: &str) -> ImportResult<String> {
    fn walk<'a>(tree: &'a [SnapshotTree], wanted: &str, found: &mut Vec<&'a SnapshotTree>) {
        for snapshot in tree {
            if snapshot.moref == wanted || snapshot.name == wanted {
                found.push(snapshot);
            }
            walk(&snapshot.children, wanted, found);
        }
    }

    let tree = client.snapshots()?;
    let mut found = Vec::new();
    walk(&tree, name_or_ref, &mut found);
    match found.as_slice() {
        [] => Err(ImportError::SnapshotNotFound(name_or_ref.to_string())),
        [snapshot] => Ok(snapshot.moref.clone()),
        many => {
            if let Some(exact) = many.iter().find(|s| s.moref == name_or_ref) {
                return Ok(exact.moref.clone());
            }
            Err(ImportError::InvalidArgument(format!(
                "\"{}\" resolves to {} snapshots",
                name_or_ref,
                many.len()
            )))
        }
    }
}

/// The disk with `disk_object_id` as it was when `snapshot` was taken.
pub fn find_snapshot_disk(
    client: &mut dyn VmwareClient,
    snapshot: &str,
    disk_object_id: &str,
) -> ImportResult<VirtualDisk> {
    client
        .disks(Some(snapshot))?
        .into_iter()
        .find(|d| d.disk_object_id == disk_object_id)
        .ok_or_else(|| {
            ImportError::DiskNotFound(format!(
                "Could not find disk image with ID {} in snapshot {}",
                disk_object_id, snapshot
            ))
        })
}

/// Every area of `disk` changed between `previous` (snapshot or change ID)
/// and `current`.
///
/// vSphere returns a bounded number of areas per call, so the query is
/// repeated from where the last page ended until a page comes back empty or
/// the disk capacity is reached.
pub fn changed_disk_areas(
    client: &mut dyn VmwareClient,
    previous: &str,
    current: &str,
    disk: &VirtualDisk,
) -> ImportResult<Vec<DiskChangeExtent>> {
    let change_id = if is_change_id(previous) {
        previous.to_string()
    } else {
        let snapshot = find_snapshot(client, previous)?;
        let base = client
            .disks(Some(&snapshot))?
            .into_iter()
            .find(|d| d.key == disk.key)
            .ok_or_else(|| {
                ImportError::DiskNotFound(format!(
                    "disk {} is not present in snapshot {}",
                    disk.key, previous
                ))
            })?;
        base.change_id.filter(|id| !id.is_empty()).ok_or_else(|| {
            ImportError::InvalidArgument(format!(
                "changed block tracking is not enabled for disk {} in snapshot {}",
                disk.file_name, previous
            ))
        })?
    };

    let mut areas = Vec::new();
    let mut offset = 0i64;
    loop {
        tracing::info!("Querying changed disk areas at offset {}", offset);
        let page = client.query_changed_disk_areas(current, disk.key, offset, &change_id)?;
        tracing::info!(
            "{} changed areas reported at offset {} with data length {}",
            page.changed_area.len(),
            offset,
            page.length
        );
        if page.changed_area.is_empty() || page.length <= 0 {
            break;
        }
        areas.extend(page.changed_area);
        offset += page.length;
        if offset >= disk.capacity_in_bytes {
            tracing::info!(
                "the offset {} is greater or equal to disk capacity {}",
                offset,
                disk.capacity_in_bytes
            );
            break;
        }
    }
    Ok(areas)
}
