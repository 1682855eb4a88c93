//! Sparse block copy from an NBD export to a [`DataSink`].

use importer_shared::ImportResult;
use importer_shared::constants::transfer::{MAX_BLOCK_STATUS_LENGTH, MIN_BLOCK_STATUS_EXTENT};

use super::nbd::{NbdOperations, STATE_HOLE, STATE_ZERO};
use crate::progress::TransferProgress;
use crate::sink::{DataSink, pwrite_all};

/// A run of bytes sharing the same allocation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockStatusData {
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
}

impl BlockStatusData {
    fn skip_reason(&self) -> Option<&'static str> {
        match (self.flags & STATE_HOLE != 0, self.flags & STATE_ZERO != 0) {
            (true, true) => Some("hole/zero block"),
            (true, false) => Some("hole"),
            (false, true) => Some("zero block"),
            (false, false) => None,
        }
    }
}

/// Allocation map of `[start, start + length)`.
///
/// Adjacent runs with equal flags are merged. Short ranges are not queried.
/// When the server cannot describe the range, it is returned as one data
/// block so it gets copied in full.
pub fn get_block_status(handle: &mut dyn NbdOperations, start: u64, length: u64) -> Vec<BlockStatusData> {
    let whole = || {
        vec![BlockStatusData {
            offset: start,
            length,
            flags: 0,
        }]
    };
    if length < MIN_BLOCK_STATUS_EXTENT {
        return whole();
    }

    let end = start + length;
    let mut blocks: Vec<BlockStatusData> = Vec::new();
    let mut last_offset = start;
    while last_offset < end {
        let request = (end - last_offset).min(MAX_BLOCK_STATUS_LENGTH);
        let descriptors = match handle.block_status(request as u32, last_offset) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                tracing::error!(
                    "Error getting block status at offset {}, returning whole block instead. Error was: {}",
                    last_offset,
                    e
                );
                return whole();
            }
        };

        let mut offset = last_offset;
        for descriptor in descriptors {
            if offset >= end {
                break;
            }
            let run = u64::from(descriptor.length).min(end - offset);
            match blocks.last_mut() {
                Some(last) if last.flags == descriptor.flags && last.offset + last.length == offset => {
                    last.length += run;
                }
                _ => blocks.push(BlockStatusData {
                    offset,
                    length: run,
                    flags: descriptor.flags,
                }),
            }
            offset += run;
        }

        if offset == last_offset {
            tracing::info!("No new block status data at offset {}, returning whole block.", offset);
            return whole();
        }
        last_offset = offset;
    }
    blocks
}

/// Copy one block: zero ranges are punched or truncated, data is read in
/// chunks of at most `max_pread` bytes.
pub fn copy_range(
    handle: &mut dyn NbdOperations,
    sink: &mut dyn DataSink,
    block: &BlockStatusData,
    max_pread: usize,
    progress: &mut TransferProgress,
) -> ImportResult<()> {
    if let Some(reason) = block.skip_reason() {
        tracing::info!(
            "Found a {}-byte {} at offset {}, filling destination with zeroes.",
            block.length,
            reason,
            block.offset
        );
        sink.zero_range(block.offset, block.length)?;
        progress.update(block.length);
        return Ok(());
    }

    let mut buffer = vec![0u8; max_pread.min(block.length as usize)];
    let mut count = 0u64;
    while count < block.length {
        let chunk = (block.length - count).min(buffer.len() as u64) as usize;
        let offset = block.offset + count;
        handle
            .pread(&mut buffer[..chunk], offset)
            .map_err(|e| e.context(format!("Error reading from source at offset {}", offset)))?;
        pwrite_all(sink, &buffer[..chunk], offset).map_err(|e| {
            e.context(format!(
                "Failed to write data block at offset {} to local file",
                block.offset
            ))
        })?;
        progress.update(chunk as u64);
        count += chunk as u64;
    }
    Ok(())
}

/// Copy `[start, start + length)` block by block.
pub fn copy_extent(
    handle: &mut dyn NbdOperations,
    sink: &mut dyn DataSink,
    start: u64,
    length: u64,
    max_pread: usize,
    progress: &mut TransferProgress,
) -> ImportResult<()> {
    for block in get_block_status(handle, start, length) {
        copy_range(handle, sink, &block, max_pread, progress)
            .map_err(|e| e.context(format!("Unable to copy block at offset {}", block.offset)))?;
    }
    Ok(())
}

/// Copy the whole export in block-status sized strides.
pub fn copy_all(
    handle: &mut dyn NbdOperations,
    sink: &mut dyn DataSink,
    size: u64,
    max_pread: usize,
    progress: &mut TransferProgress,
) -> ImportResult<()> {
    let mut start = 0u64;
    while start < size {
        let length = (size - start).min(MAX_BLOCK_STATUS_LENGTH);
        copy_extent(handle, sink, start, length, max_pread, progress)?;
        start += length;
    }
    Ok(())
}
