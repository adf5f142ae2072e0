// In-memory sorted diff: uncompressed (record, IO) pairs keyed by address.
//
// Used by the merger as its staging area and usable on its own to load a
// sorted wdiff, overlay more IOs on it and write it back out.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bytes::Bytes;

use crate::checksum::calc_checksum;
use crate::compress::CompressionType;
use crate::diff::config::{CompressOptions, blocks_to_bytes};
use crate::diff::header::DiffFileHeader;
use crate::diff::indexed_record::IndexedDiffRecord;
use crate::diff::overlap::{self, Extent, uncovered};
use crate::diff::record::DiffRecord;
use crate::diff::sorted::{SortedDiffReader, SortedDiffWriter};
use crate::error::{DiffError, Result};

// ---------------------------------------------------------------------------
// DiffRecIo
// ---------------------------------------------------------------------------

/// A record with its uncompressed IO bytes (empty unless Normal).
///
/// `rec.checksum` is left at 0 ("not calculated") when the record is cut or
/// split; writers recompute it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecIo {
    rec: DiffRecord,
    io: Bytes,
}

impl DiffRecIo {
    /// Pair an uncompressed record with its IO bytes.
    pub fn new(rec: DiffRecord, io: Bytes) -> Result<Self> {
        let r = Self { rec, io };
        r.verify(false)?;
        Ok(r)
    }

    /// Build from an indexed record and its (already uncompressed) window.
    pub fn from_indexed(rec: &IndexedDiffRecord, io: Bytes) -> Result<Self> {
        let mut r = DiffRecord {
            io_address: rec.io_address,
            io_blocks: rec.io_blocks,
            flags: rec.flags,
            compression_type: CompressionType::None,
            data_offset: 0,
            data_size: io.len() as u32,
            checksum: 0,
        };
        if !rec.is_normal() {
            r.data_size = 0;
            return Self::new(r, Bytes::new());
        }
        Self::new(r, io)
    }

    pub fn record(&self) -> &DiffRecord {
        &self.rec
    }

    pub fn io(&self) -> &Bytes {
        &self.io
    }

    pub fn into_parts(self) -> (DiffRecord, Bytes) {
        (self.rec, self.io)
    }

    /// The record with a freshly computed payload checksum.
    pub fn record_with_checksum(&self) -> DiffRecord {
        let mut r = self.rec;
        r.checksum = if r.is_normal() {
            calc_checksum(&self.io, 0)
        } else {
            0
        };
        r
    }

    /// Check record/IO consistency; optionally the stored checksum too.
    pub fn verify(&self, check_checksum: bool) -> Result<()> {
        self.rec.verify()?;
        if self.rec.is_compressed() {
            return Err(DiffError::InvalidArgument(
                "record/io pairs hold uncompressed data only".into(),
            ));
        }
        if !self.rec.is_normal() {
            if !self.io.is_empty() {
                return Err(DiffError::format("non-normal record with io data"));
            }
            return Ok(());
        }
        if self.io.len() != blocks_to_bytes(self.rec.io_blocks) {
            return Err(DiffError::format(format!(
                "{} io bytes for {} blocks",
                self.io.len(),
                self.rec.io_blocks
            )));
        }
        if check_checksum {
            let actual = calc_checksum(&self.io, 0);
            if actual != self.rec.checksum {
                return Err(DiffError::checksum("diff io", self.rec.checksum, actual));
            }
        }
        Ok(())
    }

    fn window(&self, start: u64, end: u64) -> Self {
        let mut rec = self.rec;
        rec.io_address = start;
        rec.io_blocks = (end - start) as u32;
        rec.checksum = 0;
        let io = if rec.is_normal() {
            let off = blocks_to_bytes((start - self.rec.io_address) as u32);
            let len = blocks_to_bytes(rec.io_blocks);
            rec.data_size = len as u32;
            self.io.slice(off..off + len)
        } else {
            Bytes::new()
        };
        Self { rec, io }
    }
}

impl Extent for DiffRecIo {
    fn io_address(&self) -> u64 {
        self.rec.io_address
    }

    fn io_blocks(&self) -> u32 {
        self.rec.io_blocks
    }

    fn minus(&self, other: &Self) -> Result<Vec<Self>> {
        let parts = uncovered(
            self.rec.io_address,
            self.rec.end_io_address(),
            other.rec.io_address,
            other.rec.end_io_address(),
        )?;
        Ok(parts
            .into_iter()
            .flatten()
            .map(|(s, e)| self.window(s, e))
            .collect())
    }

    fn split(&self, max_blocks: u32) -> Vec<Self> {
        if max_blocks == 0 || self.rec.io_blocks <= max_blocks {
            return vec![self.clone()];
        }
        let end = self.rec.end_io_address();
        let mut out = Vec::with_capacity(self.rec.io_blocks.div_ceil(max_blocks) as usize);
        let mut addr = self.rec.io_address;
        while addr < end {
            let next = (addr + u64::from(max_blocks)).min(end);
            out.push(self.window(addr, next));
            addr = next;
        }
        out
    }
}

// ---------------------------------------------------------------------------
// DiffMemory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DiffMemory {
    map: BTreeMap<u64, DiffRecIo>,
    header: DiffFileHeader,
    max_io_blocks: u32,
}

impl DiffMemory {
    /// `max_io_blocks` caps every stored IO; 0 means no cap.
    pub fn new(max_io_blocks: u32) -> Self {
        Self {
            max_io_blocks,
            ..Self::default()
        }
    }

    pub fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut DiffFileHeader {
        &mut self.header
    }

    /// Overlay `r`: older data under it is cut away, `r` itself is split to
    /// the IO cap.
    pub fn add(&mut self, r: DiffRecIo) -> Result<()> {
        if r.rec.is_padding() || r.rec.io_blocks == 0 {
            return Ok(());
        }
        overlap::cut_overlaps(&mut self.map, &r, self.max_io_blocks)?;
        for piece in r.split(self.max_io_blocks) {
            self.header.set_max_io_blocks_if_necessary(piece.rec.io_blocks);
            self.map.insert(piece.rec.io_address, piece);
        }
        Ok(())
    }

    pub fn front(&self) -> Option<&DiffRecIo> {
        self.map.values().next()
    }

    pub fn pop_front(&mut self) -> Option<DiffRecIo> {
        self.map.pop_first().map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffRecIo> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn n_blocks(&self) -> u64 {
        self.map.values().map(|r| u64::from(r.rec.io_blocks)).sum()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn check_no_overlapped_and_sorted(&self) -> Result<()> {
        overlap::check_sorted(&self.map)
    }

    /// Write everything as a sorted wdiff.
    pub fn write_to<W: Write>(&self, w: W, opts: CompressOptions) -> Result<W> {
        let mut writer = SortedDiffWriter::new(w);
        let mut header = self.header;
        writer.write_header(&mut header)?;
        for r in self.map.values() {
            writer.compress_and_write_diff(&r.record_with_checksum(), &r.io, opts)?;
        }
        writer.finish()
    }

    /// Load a sorted wdiff. The header is taken from the file.
    pub fn read_from<R: Read>(r: R, max_io_blocks: u32) -> Result<Self> {
        let mut reader = SortedDiffReader::new(r);
        let mut mem = Self::new(max_io_blocks);
        mem.header = reader.read_header()?;
        while let Some((rec, io)) = reader.read_and_uncompress_diff(false)? {
            mem.add(DiffRecIo::new(rec, Bytes::from(io))?)?;
        }
        Ok(mem)
    }
}
