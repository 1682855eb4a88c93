//! Pulling the disk file out of image layers.

use std::path::Path;

use importer_shared::{ImportError, ImportResult};
use tar::Archive;

use super::transport::{ImageSource, LayerBlob};
use crate::options::ContentType;
use crate::readers::FormatReaders;
use crate::sink::stream_data_to_file;
use crate::util::safe_join;

const WHITEOUT_PREFIX: &str = ".wh.";

/// Why a layer could not be processed.
#[derive(Debug)]
enum LayerError {
    /// The layer itself is unreadable; later layers may still hold the file.
    Read(ImportError),
    /// Writing the extracted file failed; the whole copy fails.
    Fatal(ImportError),
}

fn has_prefix(path: &str, prefix: &str) -> bool {
    path.starts_with(prefix) || path.strip_prefix("./").is_some_and(|p| p.starts_with(prefix))
}

fn is_whiteout(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with(WHITEOUT_PREFIX))
}

/// Extract every file under `prefix` from the layers of `source` into
/// `dest_dir`, newest layer first.
///
/// With `stop_at_first` the copy ends after the first file. Otherwise a
/// name already extracted from a newer layer is left alone. Returns the
/// number of files written.
pub fn copy_image_files(
    source: &dyn ImageSource,
    dest_dir: &Path,
    prefix: &str,
    stop_at_first: bool,
    preallocation: bool,
) -> ImportResult<usize> {
    tracing::info!(
        "Copying files from '{}' to '{}'",
        prefix,
        dest_dir.display()
    );
    let mut found = 0;
    for layer in source.layers().iter().rev() {
        tracing::info!(digest = %layer.digest, media_type = %layer.media_type, "Processing layer");
        match process_layer(source, layer, dest_dir, prefix, stop_at_first, preallocation) {
            Ok(count) => {
                found += count;
                if found > 0 && stop_at_first {
                    break;
                }
            }
            Err(LayerError::Read(e)) => {
                tracing::warn!("Error reading layer {}: {}", layer.digest, e);
            }
            Err(LayerError::Fatal(e)) => return Err(e),
        }
    }

    if found == 0 {
        tracing::error!("Failed to find VM disk image file in the container image");
        return Err(ImportError::ImageFileNotFound(
            "Failed to find VM disk image file in the container image".into(),
        ));
    }
    Ok(found)
}

fn process_layer(
    source: &dyn ImageSource,
    layer: &LayerBlob,
    dest_dir: &Path,
    prefix: &str,
    stop_at_first: bool,
    preallocation: bool,
) -> Result<usize, LayerError> {
    let read_err = |e: std::io::Error| {
        LayerError::Read(ImportError::from_io("Error reading layer", e))
    };

    let blob = source.open_layer(layer).map_err(LayerError::Read)?;
    let readers = FormatReaders::new(blob, ContentType::Archive).map_err(LayerError::Read)?;
    let mut archive = Archive::new(readers.into_top_reader());

    let mut found = 0;
    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let path = entry.path().map_err(read_err)?.into_owned();
        let name = path.to_string_lossy().into_owned();
        if !has_prefix(&name, prefix) || is_whiteout(&path) || entry.header().entry_type().is_dir() {
            continue;
        }

        tracing::info!("File '{}' found in the layer", name);
        let dest = safe_join(dest_dir, &path).ok_or_else(|| {
            LayerError::Fatal(ImportError::InvalidArgument(format!(
                "Error sanitizing archive path: content filepath is tainted: {}",
                name
            )))
        })?;
        if dest.exists() {
            tracing::debug!("{} was provided by a newer layer", name);
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LayerError::Fatal(ImportError::from_io(
                    "Error creating output file's directory",
                    e,
                ))
            })?;
        }
        stream_data_to_file(&mut entry, &dest, preallocation)
            .map_err(|e| LayerError::Fatal(e.context("Error copying file")))?;

        found += 1;
        if stop_at_first {
            break;
        }
    }
    Ok(found)
}
