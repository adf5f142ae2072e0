// Sorted-format diff record: one change to a block range.
//
// On-disk layout (32 bytes, little-endian):
//
//   0  io_address        u64   first logical block
//   8  io_blocks         u32   length in logical blocks
//  12  flags             u8    EXIST | ALLZERO | DISCARD | PADDING
//  13  compression_type  u8
//  14  reserved          u16
//  16  data_offset       u32   byte offset inside the pack's IO region
//  20  data_size         u32   stored payload bytes
//  24  checksum          u32   walb checksum (salt 0) of the stored payload
//  28  reserved          u32

use std::fmt;

use bitflags::bitflags;

use crate::checksum::calc_checksum;
use crate::compress::{self, CompressionType};
use crate::diff::config::{CompressOptions, MAX_NORMAL_IO_BLOCKS, blocks_to_bytes};
use crate::error::{DiffError, Result};

pub const DIFF_RECORD_SIZE: usize = 32;

bitflags! {
    /// Record flag bits shared by the sorted and indexed formats.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecordFlags: u8 {
        const EXIST = 1 << 0;
        const ALLZERO = 1 << 1;
        const DISCARD = 1 << 2;
        const PADDING = 1 << 3;
    }
}

/// What a record describes, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Payload bytes follow.
    Normal,
    /// The range reads as zeros.
    AllZero,
    /// The range was discarded; reads as zeros.
    Discard,
    /// Placeholder carrying no range and no data.
    Padding,
}

impl RecordFlags {
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Normal => Self::EXIST,
            RecordKind::AllZero => Self::EXIST | Self::ALLZERO,
            RecordKind::Discard => Self::EXIST | Self::DISCARD,
            RecordKind::Padding => Self::EXIST | Self::PADDING,
        }
    }

    /// `None` for flag combinations no writer produces.
    pub fn kind(self) -> Option<RecordKind> {
        if !self.contains(Self::EXIST) {
            return None;
        }
        let special = self & (Self::ALLZERO | Self::DISCARD | Self::PADDING);
        if special.is_empty() {
            Some(RecordKind::Normal)
        } else if special == Self::ALLZERO {
            Some(RecordKind::AllZero)
        } else if special == Self::DISCARD {
            Some(RecordKind::Discard)
        } else if special == Self::PADDING {
            Some(RecordKind::Padding)
        } else {
            None
        }
    }

    /// Parse a stored flag byte, rejecting unknown bits.
    pub(crate) fn decode(v: u8, what: &str) -> Result<Self> {
        Self::from_bits(v)
            .ok_or_else(|| DiffError::format(format!("{what}: unknown flag bits {v:#04x}")))
    }
}

pub(crate) fn decode_compression(v: u8, what: &str) -> Result<CompressionType> {
    CompressionType::from_u8(v)
        .ok_or_else(|| DiffError::format(format!("{what}: unknown compression type {v}")))
}

pub(crate) fn le_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

pub(crate) fn le_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

pub(crate) fn le_u64(b: &[u8], off: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(w)
}

// ---------------------------------------------------------------------------
// DiffRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffRecord {
    pub io_address: u64,
    pub io_blocks: u32,
    pub flags: RecordFlags,
    pub compression_type: CompressionType,
    pub data_offset: u32,
    pub data_size: u32,
    pub checksum: u32,
}

impl Default for DiffRecord {
    fn default() -> Self {
        Self {
            io_address: 0,
            io_blocks: 0,
            flags: RecordFlags::EXIST,
            compression_type: CompressionType::None,
            data_offset: 0,
            data_size: 0,
            checksum: 0,
        }
    }
}

impl DiffRecord {
    /// Uncompressed Normal record describing `data`.
    pub fn normal(io_address: u64, io_blocks: u32, data: &[u8]) -> Self {
        Self {
            io_address,
            io_blocks,
            data_size: data.len() as u32,
            checksum: calc_checksum(data, 0),
            ..Self::default()
        }
    }

    pub fn all_zero(io_address: u64, io_blocks: u32) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: RecordFlags::for_kind(RecordKind::AllZero),
            ..Self::default()
        }
    }

    pub fn discard(io_address: u64, io_blocks: u32) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: RecordFlags::for_kind(RecordKind::Discard),
            ..Self::default()
        }
    }

    pub fn padding(io_address: u64) -> Self {
        Self {
            io_address,
            flags: RecordFlags::for_kind(RecordKind::Padding),
            ..Self::default()
        }
    }

    #[inline]
    pub fn end_io_address(&self) -> u64 {
        self.io_address + u64::from(self.io_blocks)
    }

    /// Kind of this record. Invalid flags read as Normal; `verify` rejects them.
    pub fn kind(&self) -> RecordKind {
        self.flags.kind().unwrap_or(RecordKind::Normal)
    }

    pub fn is_normal(&self) -> bool {
        self.kind() == RecordKind::Normal
    }

    pub fn is_all_zero(&self) -> bool {
        self.flags.contains(RecordFlags::ALLZERO)
    }

    pub fn is_discard(&self) -> bool {
        self.flags.contains(RecordFlags::DISCARD)
    }

    pub fn is_padding(&self) -> bool {
        self.flags.contains(RecordFlags::PADDING)
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_type.is_compressed()
    }

    pub fn set_normal(&mut self) {
        self.flags = RecordFlags::for_kind(RecordKind::Normal);
    }

    pub fn set_all_zero(&mut self) {
        self.flags = RecordFlags::for_kind(RecordKind::AllZero);
        self.clear_payload();
    }

    pub fn set_discard(&mut self) {
        self.flags = RecordFlags::for_kind(RecordKind::Discard);
        self.clear_payload();
    }

    fn clear_payload(&mut self) {
        self.compression_type = CompressionType::None;
        self.data_size = 0;
        self.checksum = 0;
    }

    pub fn is_overlapped(&self, other: &Self) -> bool {
        self.io_address < other.end_io_address() && other.io_address < self.end_io_address()
    }

    /// Whether `other` covers this record's whole range.
    pub fn is_overwritten_by(&self, other: &Self) -> bool {
        other.io_address <= self.io_address && self.end_io_address() <= other.end_io_address()
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    /// Check flag consistency and size invariants.
    pub fn verify(&self) -> Result<()> {
        let kind = self
            .flags
            .kind()
            .ok_or_else(|| DiffError::format(format!("diff record: bad flags {:?}", self.flags)))?;
        if self.io_address.checked_add(u64::from(self.io_blocks)).is_none() {
            return Err(DiffError::format(format!(
                "diff record: {}+{} overflows the address space",
                self.io_address, self.io_blocks
            )));
        }
        match kind {
            RecordKind::Padding => {
                if self.data_size != 0 {
                    return Err(DiffError::format("diff record: padding carries data"));
                }
            }
            RecordKind::AllZero | RecordKind::Discard => {
                if self.io_blocks == 0 {
                    return Err(DiffError::format("diff record: io_blocks must not be 0"));
                }
                if self.data_size != 0 {
                    return Err(DiffError::format(format!(
                        "diff record: {kind:?} record carries {} bytes",
                        self.data_size
                    )));
                }
            }
            RecordKind::Normal => {
                if self.io_blocks == 0 {
                    return Err(DiffError::format("diff record: io_blocks must not be 0"));
                }
                if self.data_size == 0 {
                    return Err(DiffError::format("diff record: normal record without data"));
                }
                if self.io_blocks > MAX_NORMAL_IO_BLOCKS {
                    return Err(DiffError::format(format!(
                        "diff record: {} blocks exceeds the {MAX_NORMAL_IO_BLOCKS}-block io limit",
                        self.io_blocks
                    )));
                }
                if self.data_size as usize > blocks_to_bytes(self.io_blocks) {
                    return Err(DiffError::format(format!(
                        "diff record: {} stored bytes for {} blocks",
                        self.data_size, self.io_blocks
                    )));
                }
                if !self.is_compressed()
                    && self.data_size as usize != blocks_to_bytes(self.io_blocks)
                {
                    return Err(DiffError::format(format!(
                        "diff record: {} blocks but {} uncompressed bytes",
                        self.io_blocks, self.data_size
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check a stored payload against `data_size` and `checksum`.
    pub fn verify_payload(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.data_size as usize {
            return Err(DiffError::format(format!(
                "diff record: payload is {} bytes, record says {}",
                data.len(),
                self.data_size
            )));
        }
        if self.is_normal() {
            let actual = calc_checksum(data, 0);
            if actual != self.checksum {
                return Err(DiffError::checksum("diff io", self.checksum, actual));
            }
        }
        Ok(())
    }

    /// Split into pieces of at most `max_blocks`. Compressed payloads
    /// cannot be split.
    pub fn split_all(&self, max_blocks: u32) -> Result<Vec<Self>> {
        if max_blocks == 0 {
            return Err(DiffError::InvalidArgument("split_all: max_blocks is 0".into()));
        }
        if self.is_compressed() {
            return Err(DiffError::InvalidArgument(
                "split_all: compressed record cannot be split".into(),
            ));
        }
        let mut out = Vec::with_capacity(self.io_blocks.div_ceil(max_blocks) as usize);
        let mut addr = self.io_address;
        let mut remaining = self.io_blocks;
        while remaining > 0 {
            let blks = remaining.min(max_blocks);
            let mut r = *self;
            r.io_address = addr;
            r.io_blocks = blks;
            if self.is_normal() {
                r.data_size = blocks_to_bytes(blks) as u32;
            }
            out.push(r);
            addr += u64::from(blks);
            remaining -= blks;
        }
        Ok(out)
    }

    /// Compress an uncompressed Normal payload. Other records, and records
    /// already compressed, pass through unchanged.
    pub fn compress(&self, data: &[u8], opts: CompressOptions) -> Result<(Self, Vec<u8>)> {
        if !self.is_normal() || self.is_compressed() || !opts.kind.is_compressed() {
            return Ok((*self, data.to_vec()));
        }
        let (kind, stored) = compress::compress_data(opts.kind, opts.level, data)?;
        let mut rec = *self;
        rec.compression_type = kind;
        rec.data_size = stored.len() as u32;
        rec.checksum = calc_checksum(&stored, 0);
        Ok((rec, stored))
    }

    /// Decompress a compressed Normal payload. The returned record is
    /// uncompressed with `data_size = io_blocks * 512`; its checksum is
    /// recomputed when `with_checksum` is set and zeroed otherwise.
    pub fn uncompress(&self, data: &[u8], with_checksum: bool) -> Result<(Self, Vec<u8>)> {
        if !self.is_normal() || !self.is_compressed() {
            return Ok((*self, data.to_vec()));
        }
        let size = blocks_to_bytes(self.io_blocks);
        let raw = compress::uncompress_data(self.compression_type, data, size)?;
        let mut rec = *self;
        rec.compression_type = CompressionType::None;
        rec.data_size = size as u32;
        rec.checksum = if with_checksum {
            calc_checksum(&raw, 0)
        } else {
            0
        };
        Ok((rec, raw))
    }

    pub fn encode(&self) -> [u8; DIFF_RECORD_SIZE] {
        let mut b = [0u8; DIFF_RECORD_SIZE];
        b[0..8].copy_from_slice(&self.io_address.to_le_bytes());
        b[8..12].copy_from_slice(&self.io_blocks.to_le_bytes());
        b[12] = self.flags.bits();
        b[13] = self.compression_type.as_u8();
        b[16..20].copy_from_slice(&self.data_offset.to_le_bytes());
        b[20..24].copy_from_slice(&self.data_size.to_le_bytes());
        b[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    /// Parse 32 bytes. Field values are not validated beyond known tags.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < DIFF_RECORD_SIZE {
            return Err(DiffError::truncated(format!(
                "diff record needs {DIFF_RECORD_SIZE} bytes, got {}",
                b.len()
            )));
        }
        Ok(Self {
            io_address: le_u64(b, 0),
            io_blocks: le_u32(b, 8),
            flags: RecordFlags::decode(b[12], "diff record")?,
            compression_type: decode_compression(b[13], "diff record")?,
            data_offset: le_u32(b, 16),
            data_size: le_u32(b, 20),
            checksum: le_u32(b, 24),
        })
    }
}

impl fmt::Display for DiffRecord {
    /// `addr blocks cmpr offset size checksum flags`, tab separated.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{:08x}\t{}{}",
            self.io_address,
            self.io_blocks,
            self.compression_type,
            self.data_offset,
            self.data_size,
            self.checksum,
            if self.is_all_zero() { 'Z' } else { '-' },
            if self.is_discard() { 'D' } else { '-' },
        )
    }
}
