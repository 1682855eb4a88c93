//! Image format utilities: header signatures and ISO sizing.

pub mod header;
pub mod iso;

pub use header::{Header, HeaderFormat, KNOWN_HEADERS, detect, match_header};
pub use iso::raw_size;
