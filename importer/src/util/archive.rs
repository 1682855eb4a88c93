//! Tar extraction into a target directory.

use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use importer_shared::{ImportError, ImportResult};
use tar::{Archive, EntryType};

/// Join an archive entry path onto `root`, refusing anything that would land
/// outside it. Leading `/` and `.` components are dropped; `..` may only
/// climb back out of components the path itself added.
pub fn safe_join(root: &Path, entry: &Path) -> Option<PathBuf> {
    let mut components = Vec::new();
    for comp in entry.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                components.pop()?;
            }
            Component::Normal(c) => components.push(c.to_os_string()),
        }
    }
    if components.is_empty() {
        return None;
    }
    Some(root.join(components.into_iter().collect::<PathBuf>()))
}

/// Unpack a tar stream into `dest`. Regular files, directories and symlinks
/// are created; other entry types are skipped. Returns the bytes written.
pub fn unarchive_tar<R: Read>(reader: R, dest: &Path) -> ImportResult<u64> {
    fs::create_dir_all(dest).map_err(|e| {
        ImportError::Storage(format!(
            "Failed to create destination directory {}: {}",
            dest.display(),
            e
        ))
    })?;

    let mut archive = Archive::new(reader);
    let mut total = 0u64;
    let entries = archive
        .entries()
        .map_err(|e| ImportError::Storage(format!("Tar read entries error: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| ImportError::Storage(format!("Tar read entry error: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| ImportError::Storage(format!("Tar parse header path error: {}", e)))?
            .into_owned();
        let Some(full_path) = safe_join(dest, &raw_path) else {
            tracing::debug!("Skipping path outside root: {}", raw_path.display());
            continue;
        };

        match entry.header().entry_type() {
            EntryType::Directory => create_dir(&full_path)?,
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                ensure_parent(&full_path)?;
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut file = fs::File::create(&full_path).map_err(|e| {
                    ImportError::from_io(format!("create {}", full_path.display()), e)
                })?;
                total += io::copy(&mut entry, &mut file).map_err(|e| {
                    ImportError::from_io(format!("write {}", full_path.display()), e)
                })?;
                if let Err(e) = fs::set_permissions(&full_path, fs::Permissions::from_mode(mode & 0o777)) {
                    tracing::warn!("Failed to set mode on {}: {}", full_path.display(), e);
                }
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| ImportError::Storage(format!("Tar read link name error: {}", e)))?
                    .ok_or_else(|| {
                        ImportError::Storage(format!("Symlink without target: {}", raw_path.display()))
                    })?
                    .into_owned();
                ensure_parent(&full_path)?;
                let _ = fs::remove_file(&full_path);
                std::os::unix::fs::symlink(&target, &full_path).map_err(|e| {
                    ImportError::from_io(format!("symlink {}", full_path.display()), e)
                })?;
            }
            other => {
                tracing::debug!("Skipping {:?} entry {}", other, raw_path.display());
            }
        }
    }
    Ok(total)
}

fn create_dir(path: &Path) -> ImportResult<()> {
    fs::create_dir_all(path).map_err(|e| ImportError::from_io(format!("mkdir {}", path.display()), e))
}

fn ensure_parent(path: &Path) -> ImportResult<()> {
    match path.parent() {
        Some(parent) => create_dir(parent),
        None => Ok(()),
    }
}
