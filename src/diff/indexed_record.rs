// Indexed-format diff record.
//
// On-disk layout (48 bytes, little-endian, 8-byte aligned):
//
//   0  io_address        u64   first logical block
//   8  data_offset       u64   absolute file offset of the stored payload
//  16  io_blocks         u32   length in logical blocks
//  20  orig_blocks       u32   uncompressed block count of the stored payload
//  24  io_offset         u32   first block of this record inside the payload
//  28  data_size         u32   stored payload bytes
//  32  io_checksum       u32   walb checksum of the uncompressed payload
//  36  rec_checksum      u32   self-verifying checksum of these 48 bytes
//  40  flags             u8
//  41  compression_type  u8
//  42  reserved          [u8; 6]
//
// Several records may share one stored payload after splitting or overlap
// elimination; they differ only in io_address / io_blocks / io_offset.

use std::fmt;

use crate::checksum::{calc_checksum, is_sealed, seal};
use crate::compress::CompressionType;
use crate::diff::config::{MAX_NORMAL_IO_BLOCKS, blocks_to_bytes};
use crate::diff::overlap::{Extent, uncovered};
use crate::diff::record::{
    RecordFlags, RecordKind, decode_compression, le_u32, le_u64,
};
use crate::error::{DiffError, Result};

pub const INDEXED_RECORD_SIZE: usize = 48;

const REC_CHECKSUM_OFFSET: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedDiffRecord {
    pub io_address: u64,
    pub data_offset: u64,
    pub io_blocks: u32,
    pub orig_blocks: u32,
    pub io_offset: u32,
    pub data_size: u32,
    pub io_checksum: u32,
    pub rec_checksum: u32,
    pub flags: RecordFlags,
    pub compression_type: CompressionType,
}

impl Default for IndexedDiffRecord {
    fn default() -> Self {
        Self {
            io_address: 0,
            data_offset: 0,
            io_blocks: 0,
            orig_blocks: 0,
            io_offset: 0,
            data_size: 0,
            io_checksum: 0,
            rec_checksum: 0,
            flags: RecordFlags::EXIST,
            compression_type: CompressionType::None,
        }
    }
}

impl IndexedDiffRecord {
    /// Uncompressed Normal record describing `data`. `data_offset` is
    /// stamped by the writer.
    pub fn normal(io_address: u64, io_blocks: u32, data: &[u8]) -> Self {
        Self {
            io_address,
            io_blocks,
            orig_blocks: io_blocks,
            data_size: data.len() as u32,
            io_checksum: calc_checksum(data, 0),
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

    #[inline]
    pub fn end_io_address(&self) -> u64 {
        self.io_address + u64::from(self.io_blocks)
    }

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

    pub fn is_overlapped(&self, other: &Self) -> bool {
        self.overlaps(other)
    }

    pub fn is_overwritten_by(&self, other: &Self) -> bool {
        other.io_address <= self.io_address && self.end_io_address() <= other.end_io_address()
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    /// Check flag consistency and the payload window.
    pub fn verify(&self) -> Result<()> {
        let kind = self.flags.kind().ok_or_else(|| {
            DiffError::format(format!("indexed record: bad flags {:?}", self.flags))
        })?;
        if kind != RecordKind::Padding && self.io_blocks == 0 {
            return Err(DiffError::format("indexed record: io_blocks must not be 0"));
        }
        if self.io_address.checked_add(u64::from(self.io_blocks)).is_none() {
            return Err(DiffError::format(format!(
                "indexed record: {}+{} overflows the address space",
                self.io_address, self.io_blocks
            )));
        }
        if kind != RecordKind::Normal {
            if self.data_size != 0 {
                return Err(DiffError::format(format!(
                    "indexed record: {kind:?} record carries {} bytes",
                    self.data_size
                )));
            }
            return Ok(());
        }
        if self.data_size == 0 {
            return Err(DiffError::format("indexed record: normal record without data"));
        }
        if self.orig_blocks > MAX_NORMAL_IO_BLOCKS {
            return Err(DiffError::format(format!(
                "indexed record: {} payload blocks exceeds the {MAX_NORMAL_IO_BLOCKS}-block io limit",
                self.orig_blocks
            )));
        }
        if self.data_size as usize > blocks_to_bytes(self.orig_blocks) {
            return Err(DiffError::format(format!(
                "indexed record: {} stored bytes for {} payload blocks",
                self.data_size, self.orig_blocks
            )));
        }
        if u64::from(self.io_offset) + u64::from(self.io_blocks) > u64::from(self.orig_blocks) {
            return Err(DiffError::format(format!(
                "indexed record: window {}+{} exceeds {} payload blocks",
                self.io_offset, self.io_blocks, self.orig_blocks
            )));
        }
        if !self.is_compressed() && self.data_size as usize != blocks_to_bytes(self.orig_blocks) {
            return Err(DiffError::format(format!(
                "indexed record: {} blocks but {} uncompressed bytes",
                self.orig_blocks, self.data_size
            )));
        }
        Ok(())
    }

    /// Serialize, sealing `rec_checksum` into the output.
    pub fn encode(&self) -> [u8; INDEXED_RECORD_SIZE] {
        let mut b = [0u8; INDEXED_RECORD_SIZE];
        b[0..8].copy_from_slice(&self.io_address.to_le_bytes());
        b[8..16].copy_from_slice(&self.data_offset.to_le_bytes());
        b[16..20].copy_from_slice(&self.io_blocks.to_le_bytes());
        b[20..24].copy_from_slice(&self.orig_blocks.to_le_bytes());
        b[24..28].copy_from_slice(&self.io_offset.to_le_bytes());
        b[28..32].copy_from_slice(&self.data_size.to_le_bytes());
        b[32..36].copy_from_slice(&self.io_checksum.to_le_bytes());
        b[40] = self.flags.bits();
        b[41] = self.compression_type.as_u8();
        seal(&mut b, REC_CHECKSUM_OFFSET, 0);
        b
    }

    /// Recompute and store `rec_checksum`.
    pub fn update_rec_checksum(&mut self) {
        let b = self.encode();
        self.rec_checksum = le_u32(&b, REC_CHECKSUM_OFFSET);
    }

    /// Parse and check the record checksum.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < INDEXED_RECORD_SIZE {
            return Err(DiffError::truncated(format!(
                "indexed record needs {INDEXED_RECORD_SIZE} bytes, got {}",
                b.len()
            )));
        }
        let b = &b[..INDEXED_RECORD_SIZE];
        let rec_checksum = le_u32(b, REC_CHECKSUM_OFFSET);
        if !is_sealed(b, 0) {
            let mut copy = [0u8; INDEXED_RECORD_SIZE];
            copy.copy_from_slice(b);
            let expected = seal(&mut copy, REC_CHECKSUM_OFFSET, 0);
            return Err(DiffError::checksum("indexed record", expected, rec_checksum));
        }
        Ok(Self {
            io_address: le_u64(b, 0),
            data_offset: le_u64(b, 8),
            io_blocks: le_u32(b, 16),
            orig_blocks: le_u32(b, 20),
            io_offset: le_u32(b, 24),
            data_size: le_u32(b, 28),
            io_checksum: le_u32(b, 32),
            rec_checksum,
            flags: RecordFlags::decode(b[40], "indexed record")?,
            compression_type: decode_compression(b[41], "indexed record")?,
        })
    }

    /// Copy of `self` narrowed to `[start, end)`.
    fn window(&self, start: u64, end: u64) -> Self {
        let mut r = *self;
        r.io_address = start;
        r.io_blocks = (end - start) as u32;
        if self.is_normal() {
            r.io_offset = self.io_offset + (start - self.io_address) as u32;
        }
        r.rec_checksum = 0;
        r
    }
}

impl Extent for IndexedDiffRecord {
    fn io_address(&self) -> u64 {
        self.io_address
    }

    fn io_blocks(&self) -> u32 {
        self.io_blocks
    }

    fn minus(&self, other: &Self) -> Result<Vec<Self>> {
        let parts = uncovered(
            self.io_address,
            self.end_io_address(),
            other.io_address,
            other.end_io_address(),
        )?;
        Ok(parts
            .into_iter()
            .flatten()
            .map(|(s, e)| self.window(s, e))
            .collect())
    }

    fn split(&self, max_blocks: u32) -> Vec<Self> {
        if max_blocks == 0 || self.io_blocks <= max_blocks {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(self.io_blocks.div_ceil(max_blocks) as usize);
        let mut addr = self.io_address;
        let end = self.end_io_address();
        while addr < end {
            let next = (addr + u64::from(max_blocks)).min(end);
            out.push(self.window(addr, next));
            addr = next;
        }
        out
    }
}

impl fmt::Display for IndexedDiffRecord {
    /// `addr blocks cmpr offset size orig io_offset io_csum rec_csum flags`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:08x}\t{:08x}\t{}{}",
            self.io_address,
            self.io_blocks,
            self.compression_type,
            self.data_offset,
            self.data_size,
            self.orig_blocks,
            self.io_offset,
            self.io_checksum,
            self.rec_checksum,
            if self.is_all_zero() { 'Z' } else { '-' },
            if self.is_discard() { 'D' } else { '-' },
        )
    }
}
