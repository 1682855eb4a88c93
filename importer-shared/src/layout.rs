//! Destination layout of one import.
//!
//! An import writes either to a regular file inside a data directory
//! (filesystem volume) or straight to a block device (block volume). A scratch
//! directory may be mounted next to it for payloads that cannot be converted
//! from the origin stream.
//!
//! ```text
//! filesystem mode              block mode
//! /data/                       /dev/cdi-block-volume
//! └── disk.img
//! /scratch/                    /scratch/
//! └── tmpimage                 └── tmpimage
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::paths;

// ============================================================================
// VOLUME MODE
// ============================================================================

/// How the destination volume is presented to the importer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

impl FromStr for VolumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "filesystem" => Ok(VolumeMode::Filesystem),
            "block" => Ok(VolumeMode::Block),
            other => Err(format!("unknown volume mode '{}'", other)),
        }
    }
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeMode::Filesystem => write!(f, "Filesystem"),
            VolumeMode::Block => write!(f, "Block"),
        }
    }
}

// ============================================================================
// IMPORT LAYOUT
// ============================================================================

/// Paths used by one import.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportLayout {
    /// Destination image file or block device.
    pub data_file: PathBuf,

    /// Directory holding `data_file`. Absent for block destinations.
    pub data_dir: Option<PathBuf>,

    /// Scratch directory, if one is mounted.
    pub scratch_dir: Option<PathBuf>,
}

impl ImportLayout {
    /// Layout rooted at the standard pod mounts for the given volume mode.
    pub fn standard(mode: VolumeMode) -> Self {
        match mode {
            VolumeMode::Filesystem => Self {
                data_file: PathBuf::from(paths::DATA_FILE),
                data_dir: Some(PathBuf::from(paths::DATA_DIR)),
                scratch_dir: Some(PathBuf::from(paths::SCRATCH_DIR)),
            },
            VolumeMode::Block => Self {
                data_file: PathBuf::from(paths::BLOCK_DEVICE),
                data_dir: None,
                scratch_dir: Some(PathBuf::from(paths::SCRATCH_DIR)),
            },
        }
    }

    /// Filesystem layout with `disk.img` inside `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            data_file: data_dir.join("disk.img"),
            data_dir: Some(data_dir),
            scratch_dir: None,
        }
    }

    pub fn with_scratch(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(scratch_dir.into());
        self
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch_dir.as_deref()
    }

    /// Temporary image path inside a transfer directory.
    pub fn scratch_image(dir: &Path) -> PathBuf {
        dir.join(paths::SCRATCH_IMAGE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_filesystem_layout() {
        let layout = ImportLayout::standard(VolumeMode::Filesystem);
        assert_eq!(layout.data_file(), Path::new("/data/disk.img"));
        assert_eq!(layout.data_dir(), Some(Path::new("/data")));
        assert_eq!(layout.scratch_dir(), Some(Path::new("/scratch")));
    }

    #[test]
    fn test_standard_block_layout_has_no_data_dir() {
        let layout = ImportLayout::standard(VolumeMode::Block);
        assert_eq!(layout.data_file(), Path::new("/dev/cdi-block-volume"));
        assert!(layout.data_dir().is_none());
    }

    #[test]
    fn test_volume_mode_parse() {
        assert_eq!("block".parse::<VolumeMode>().unwrap(), VolumeMode::Block);
        assert_eq!("Filesystem".parse::<VolumeMode>().unwrap(), VolumeMode::Filesystem);
        assert_eq!("".parse::<VolumeMode>().unwrap(), VolumeMode::Filesystem);
        assert!("tape".parse::<VolumeMode>().is_err());
    }

    #[test]
    fn test_scratch_image_name() {
        assert_eq!(
            ImportLayout::scratch_image(Path::new("/scratch")),
            PathBuf::from("/scratch/tmpimage")
        );
    }
}
