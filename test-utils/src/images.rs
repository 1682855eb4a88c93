//! Payload builders for format detection and streaming tests.

use std::io::Write;

/// A qcow2 v3 header claiming `virtual_size` bytes.
pub fn qcow2_header(virtual_size: u64) -> Vec<u8> {
    let mut header = vec![0u8; 2048];
    header[..4].copy_from_slice(b"QFI\xfb");
    header[4..8].copy_from_slice(&3u32.to_be_bytes());
    header[24..32].copy_from_slice(&virtual_size.to_be_bytes());
    header
}

/// `len` bytes of a repeating non-zero pattern.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).expect("Should compress");
    encoder.finish().expect("Should finish gzip")
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 1);
    encoder.write_all(data).expect("Should compress");
    encoder.finish().expect("Should finish xz")
}

/// A tar archive holding `entries` as regular files.
pub fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("Should append tar entry");
    }
    builder.into_inner().expect("Should finish tar")
}
