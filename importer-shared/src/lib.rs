//! Importer shared code
//!
//! Types and constants used by both the importer library and the binary
//! that wraps it, and by anything that reads the importer's results back.

pub mod constants;
pub mod errors;
pub mod layout;
pub mod termination;

pub use errors::{ErrorKind, ImportError, ImportResult};
pub use layout::{ImportLayout, VolumeMode};
pub use termination::{TerminationMessage, VddkInfo};
