//! ISO 9660 size detection from the primary volume descriptor.

/// Logical sector size of an ISO 9660 image.
pub const ISO_SECTOR_SIZE: u64 = 2048;

/// Byte offset of the primary volume descriptor (LBA 16).
pub const PRIMARY_VD_OFFSET: usize = 16 * ISO_SECTOR_SIZE as usize;

const VD_TYPE_OFF: usize = 0;
const VD_ID_OFF: usize = 1;
const VD_ID: &[u8] = b"CD001";
const VD_NUM_SECTORS_OFF: usize = 84;
const VD_NUM_SECTORS_LEN: usize = 4;
const VD_SECTOR_SIZE_OFF: usize = 130;
const VD_SECTOR_SIZE_LEN: usize = 2;
const PRIMARY_VD_TYPE: u8 = 1;

/// Bytes that must be read from the start of the stream to size an ISO.
pub const ISO_PROBE_LEN: usize = PRIMARY_VD_OFFSET + VD_SECTOR_SIZE_OFF + VD_SECTOR_SIZE_LEN;

fn be(buf: &[u8]) -> u64 {
    buf.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Size of the ISO image starting at `buf[0]`, or 0 when `buf` does not hold a
/// primary volume descriptor.
///
/// The size is `numSectors * sectorSize` from the descriptor's big-endian
/// fields. A result that is not a whole number of 2048-byte sectors is not an
/// ISO image.
pub fn raw_size(buf: &[u8]) -> u64 {
    if buf.len() < ISO_PROBE_LEN {
        return 0;
    }
    let vd = &buf[PRIMARY_VD_OFFSET..];
    if vd[VD_TYPE_OFF] != PRIMARY_VD_TYPE || &vd[VD_ID_OFF..VD_ID_OFF + VD_ID.len()] != VD_ID {
        return 0;
    }

    // Both-endian fields; the big-endian half follows the little-endian one.
    let num_sectors = be(&vd[VD_NUM_SECTORS_OFF..VD_NUM_SECTORS_OFF + VD_NUM_SECTORS_LEN]);
    let sector_size = be(&vd[VD_SECTOR_SIZE_OFF..VD_SECTOR_SIZE_OFF + VD_SECTOR_SIZE_LEN]);
    let size = num_sectors.saturating_mul(sector_size);
    if size % ISO_SECTOR_SIZE != 0 {
        return 0;
    }
    size
}
