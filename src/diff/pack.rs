// Sorted-format pack: a 4 KiB header block listing up to 127 records,
// followed by their concatenated payloads.
//
// Pack header layout (4096 bytes, little-endian):
//
//   0  checksum     u32   self-verifying over the whole 4 KiB block
//   4  n_records    u16
//   6  flags        u8    bit 0 = END (terminal pack, no records)
//   7  reserved     u8
//   8  total_size   u32   payload bytes following the header
//  12  reserved     u32
//  16  records      [DiffRecord; 127]

use log::trace;

use crate::checksum::{is_sealed, seal};
use crate::diff::config::{PACK_HEADER_SIZE, PackLimits, blocks_to_bytes};
use crate::diff::record::{DIFF_RECORD_SIZE, DiffRecord, le_u16, le_u32};
use crate::error::{DiffError, Result};

const RECORDS_OFFSET: usize = 16;

pub const MAX_RECORDS_IN_PACK: usize = (PACK_HEADER_SIZE - RECORDS_OFFSET) / DIFF_RECORD_SIZE;

const FLAG_END: u8 = 1 << 0;

// ---------------------------------------------------------------------------
// DiffPackHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPackHeader {
    records: Vec<DiffRecord>,
    total_size: u32,
    end: bool,
    limits: PackLimits,
}

impl Default for DiffPackHeader {
    fn default() -> Self {
        Self::new(PackLimits::default())
    }
}

impl DiffPackHeader {
    pub fn new(limits: PackLimits) -> Self {
        Self {
            records: Vec::new(),
            total_size: 0,
            end: false,
            limits: PackLimits {
                max_records: limits.max_records.clamp(1, MAX_RECORDS_IN_PACK),
                ..limits
            },
        }
    }

    /// The terminal pack.
    pub fn end_marker() -> Self {
        let mut p = Self::default();
        p.end = true;
        p
    }

    pub fn is_end(&self) -> bool {
        self.end
    }

    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn records(&self) -> &[DiffRecord] {
        &self.records
    }

    pub fn record(&self, i: usize) -> &DiffRecord {
        &self.records[i]
    }

    /// Whether a record with `data_size` payload bytes fits. An empty pack
    /// accepts anything.
    pub fn can_add(&self, data_size: u32) -> bool {
        if self.records.len() >= self.limits.max_records {
            return false;
        }
        if !self.records.is_empty()
            && u64::from(self.total_size) + u64::from(data_size)
                > u64::from(self.limits.max_total_size)
        {
            return false;
        }
        true
    }

    /// Append `rec`, stamping its `data_offset`. Returns false if full.
    pub fn add(&mut self, rec: &DiffRecord) -> bool {
        if !self.can_add(rec.data_size) {
            return false;
        }
        let mut r = *rec;
        r.data_offset = self.total_size;
        self.total_size += r.data_size;
        self.records.push(r);
        true
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.total_size = 0;
        self.end = false;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; PACK_HEADER_SIZE];
        b[4..6].copy_from_slice(&(self.records.len() as u16).to_le_bytes());
        b[6] = if self.end { FLAG_END } else { 0 };
        b[8..12].copy_from_slice(&self.total_size.to_le_bytes());
        for (i, rec) in self.records.iter().enumerate() {
            let off = RECORDS_OFFSET + i * DIFF_RECORD_SIZE;
            b[off..off + DIFF_RECORD_SIZE].copy_from_slice(&rec.encode());
        }
        seal(&mut b, 0, 0);
        b
    }

    /// Parse a 4 KiB header block and validate every record.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < PACK_HEADER_SIZE {
            return Err(DiffError::truncated(format!(
                "pack header needs {PACK_HEADER_SIZE} bytes, got {}",
                b.len()
            )));
        }
        let b = &b[..PACK_HEADER_SIZE];
        if !is_sealed(b, 0) {
            let mut copy = b.to_vec();
            let expected = seal(&mut copy, 0, 0);
            return Err(DiffError::checksum("pack header", expected, le_u32(b, 0)));
        }
        let n = le_u16(b, 4) as usize;
        if n > MAX_RECORDS_IN_PACK {
            return Err(DiffError::format(format!("pack header: {n} records")));
        }
        let end = b[6] & FLAG_END != 0;
        if end && n != 0 {
            return Err(DiffError::format("pack header: end pack with records"));
        }
        let mut records = Vec::with_capacity(n);
        let mut expected_offset: u64 = 0;
        for i in 0..n {
            let off = RECORDS_OFFSET + i * DIFF_RECORD_SIZE;
            let rec = DiffRecord::decode(&b[off..off + DIFF_RECORD_SIZE])?;
            rec.verify()?;
            expected_offset += u64::from(rec.data_size);
            records.push(rec);
        }
        let total_size = le_u32(b, 8);
        if expected_offset != u64::from(total_size) {
            return Err(DiffError::format(format!(
                "pack header: records hold {expected_offset} bytes, total_size is {total_size}"
            )));
        }
        Ok(Self {
            records,
            total_size,
            end,
            limits: PackLimits {
                max_records: MAX_RECORDS_IN_PACK,
                max_total_size: u32::MAX,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// DiffPacker
// ---------------------------------------------------------------------------

/// Builds one pack in memory: header plus queued payloads.
#[derive(Debug, Default)]
pub struct DiffPacker {
    header: DiffPackHeader,
    data: Vec<u8>,
}

impl DiffPacker {
    pub fn new(limits: PackLimits) -> Self {
        Self {
            header: DiffPackHeader::new(limits),
            data: Vec::new(),
        }
    }

    pub fn header(&self) -> &DiffPackHeader {
        &self.header
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_empty()
    }

    /// Queue `rec` and its stored payload. Returns false if the pack is full.
    pub fn add(&mut self, rec: &DiffRecord, data: &[u8]) -> Result<bool> {
        if data.len() != rec.data_size as usize {
            return Err(DiffError::InvalidArgument(format!(
                "payload is {} bytes, record says {}",
                data.len(),
                rec.data_size
            )));
        }
        if !self.header.add(rec) {
            return Ok(false);
        }
        if rec.is_normal() {
            self.data.extend_from_slice(data);
        }
        Ok(true)
    }

    /// Queue an uncompressed IO given as raw blocks; all-zero data becomes an
    /// AllZero record with no payload.
    pub fn add_io(&mut self, io_address: u64, io_blocks: u32, data: &[u8]) -> Result<bool> {
        if io_blocks == 0 || data.len() != blocks_to_bytes(io_blocks) {
            return Err(DiffError::InvalidArgument(format!(
                "{} bytes for {io_blocks} blocks",
                data.len()
            )));
        }
        if data.iter().all(|&b| b == 0) {
            return self.add(&DiffRecord::all_zero(io_address, io_blocks), &[]);
        }
        self.add(&DiffRecord::normal(io_address, io_blocks, data), data)
    }

    /// Serialize the pack (header then payloads) and reset.
    pub fn take(&mut self) -> Vec<u8> {
        let mut out = self.header.encode();
        out.append(&mut self.data);
        trace!(
            "pack: {} records, {} payload bytes",
            self.header.n_records(),
            self.header.total_size()
        );
        self.header.clear();
        out
    }
}
