//! Magic-number detection for container and payload formats.

use std::fmt;

/// Formats recognised from their first bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeaderFormat {
    Gz,
    Qcow2,
    Tar,
    Xz,
}

impl fmt::Display for HeaderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeaderFormat::Gz => "gz",
            HeaderFormat::Qcow2 => "qcow2",
            HeaderFormat::Tar => "tar",
            HeaderFormat::Xz => "xz",
        };
        f.write_str(name)
    }
}

/// Signature of one format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub format: HeaderFormat,
    pub magic: &'static [u8],
    pub magic_offset: usize,
    /// Offset of a big-endian size field, if the header carries one.
    pub size_offset: usize,
    pub size_len: usize,
}

/// Every known header, in match order.
pub const KNOWN_HEADERS: [Header; 4] = [
    Header {
        format: HeaderFormat::Gz,
        magic: &[0x1F, 0x8B],
        magic_offset: 0,
        size_offset: 0,
        size_len: 0,
    },
    Header {
        format: HeaderFormat::Qcow2,
        magic: b"QFI\xfb",
        magic_offset: 0,
        size_offset: 24,
        size_len: 8,
    },
    Header {
        format: HeaderFormat::Tar,
        magic: b"ustar",
        magic_offset: 257,
        size_offset: 124,
        size_len: 8,
    },
    Header {
        format: HeaderFormat::Xz,
        magic: &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00],
        magic_offset: 0,
        size_offset: 0,
        size_len: 0,
    },
];

impl Header {
    /// Whether `buf` starts with this format's signature.
    pub fn matches(&self, buf: &[u8]) -> bool {
        let end = self.magic_offset + self.magic.len();
        buf.len() >= end && &buf[self.magic_offset..end] == self.magic
    }

    /// Size recorded in the header, for formats that record one as a
    /// big-endian integer.
    ///
    /// Tar stores its member size as octal text; the tar reader parses it.
    pub fn size(&self, buf: &[u8]) -> Option<u64> {
        if self.format == HeaderFormat::Tar || self.size_len == 0 || self.size_len > 8 {
            return None;
        }
        let field = buf.get(self.size_offset..self.size_offset + self.size_len)?;
        Some(field.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}

/// First header in `candidates` whose signature matches `buf`.
pub fn match_header(buf: &[u8], candidates: &[Header]) -> Option<Header> {
    candidates.iter().find(|h| h.matches(buf)).copied()
}

/// Format of `buf` among all known headers.
pub fn detect(buf: &[u8]) -> Option<HeaderFormat> {
    match_header(buf, &KNOWN_HEADERS).map(|h| h.format)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qcow2_header(virtual_size: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[0..4].copy_from_slice(b"QFI\xfb");
        buf[4..8].copy_from_slice(&3u32.to_be_bytes());
        buf[24..32].copy_from_slice(&virtual_size.to_be_bytes());
        buf
    }

    #[test]
    fn test_detect_each_format() {
        assert_eq!(detect(&[0x1F, 0x8B, 0x08, 0x00]), Some(HeaderFormat::Gz));
        assert_eq!(detect(&qcow2_header(1 << 30)), Some(HeaderFormat::Qcow2));
        assert_eq!(
            detect(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00]),
            Some(HeaderFormat::Xz)
        );

        let mut tar = vec![0u8; 512];
        tar[257..263].copy_from_slice(b"ustar\0");
        assert_eq!(detect(&tar), Some(HeaderFormat::Tar));
    }

    #[test]
    fn test_short_buffer_does_not_match() {
        assert_eq!(detect(&[0x1F]), None);
        assert_eq!(detect(&[0u8; 260]), None);
        assert_eq!(detect(b""), None);
    }

    #[test]
    fn test_qcow2_virtual_size() {
        let buf = qcow2_header(46_137_344);
        let header = match_header(&buf, &KNOWN_HEADERS).expect("Should match qcow2");
        assert_eq!(header.size(&buf), Some(46_137_344));
    }

    #[test]
    fn test_formats_without_size_field() {
        let gz = KNOWN_HEADERS[0];
        assert_eq!(gz.size(&[0x1F, 0x8B]), None);
    }

    #[test]
    fn test_removed_candidate_is_skipped() {
        let buf = [0x1F, 0x8B, 0x08];
        let remaining: Vec<Header> = KNOWN_HEADERS
            .iter()
            .filter(|h| h.format != HeaderFormat::Gz)
            .copied()
            .collect();
        assert!(match_header(&buf, &remaining).is_none());
    }
}
