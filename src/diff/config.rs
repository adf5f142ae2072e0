// Limits and tunables for the diff formats.

use crate::compress::CompressionType;

/// Addressing unit of every IO range (bytes).
pub const LOGICAL_BLOCK_SIZE: usize = 512;

/// Current diff file format version.
pub const DIFF_VERSION: u32 = 2;

/// Size of a sorted-format pack header block.
pub const PACK_HEADER_SIZE: usize = 4096;

/// Upper bound on payload bytes queued in one sorted pack (32 MiB).
pub const MAX_PACK_TOTAL_SIZE: u32 = 32 << 20;

/// Largest uncompressed payload a Normal record may carry (blocks). Readers
/// reject anything bigger before allocating for it.
pub const MAX_NORMAL_IO_BLOCKS: u32 = MAX_PACK_TOTAL_SIZE / LOGICAL_BLOCK_SIZE as u32;

/// Largest IO a single diff record may describe after splitting (blocks).
/// 64 KiB worth of logical blocks.
pub const DEFAULT_MAX_IO_BLOCKS: u32 = 128;

/// Default byte budget for the indexed IO cache (32 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 32 << 20;

/// Default zlib level used when the caller does not pick one.
pub const DEFAULT_COMPRESS_LEVEL: u32 = 0;

/// Convert a block count to bytes.
#[inline]
pub const fn blocks_to_bytes(blocks: u32) -> usize {
    blocks as usize * LOGICAL_BLOCK_SIZE
}

/// How writers compress Normal payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOptions {
    pub kind: CompressionType,
    pub level: u32,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            kind: CompressionType::Snappy,
            level: DEFAULT_COMPRESS_LEVEL,
        }
    }
}

impl CompressOptions {
    pub fn none() -> Self {
        Self {
            kind: CompressionType::None,
            level: 0,
        }
    }
}

/// Capacity of one sorted-format pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLimits {
    pub max_records: usize,
    pub max_total_size: u32,
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            max_records: crate::diff::pack::MAX_RECORDS_IN_PACK,
            max_total_size: MAX_PACK_TOTAL_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_conversion() {
        assert_eq!(blocks_to_bytes(0), 0);
        assert_eq!(blocks_to_bytes(DEFAULT_MAX_IO_BLOCKS), 64 * 1024);
    }

    #[test]
    fn default_pack_limits_fit_header() {
        let l = PackLimits::default();
        assert_eq!(l.max_records, (PACK_HEADER_SIZE - 16) / 32);
    }
}
