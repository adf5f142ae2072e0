// In-memory index of an indexed diff: address-ordered, non-overlapping
// records with last-writer-wins overlap resolution.

use std::collections::BTreeMap;
use std::io::Write;

use crate::diff::config::DEFAULT_MAX_IO_BLOCKS;
use crate::diff::indexed_record::IndexedDiffRecord;
use crate::diff::overlap;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DiffIndexMem {
    index: BTreeMap<u64, IndexedDiffRecord>,
    max_io_blocks: u32,
}

impl Default for DiffIndexMem {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IO_BLOCKS)
    }
}

impl DiffIndexMem {
    /// `max_io_blocks` caps the fragments left behind by overlap
    /// elimination; 0 disables splitting.
    pub fn new(max_io_blocks: u32) -> Self {
        Self {
            index: BTreeMap::new(),
            max_io_blocks,
        }
    }

    pub fn max_io_blocks(&self) -> u32 {
        self.max_io_blocks
    }

    /// Insert `rec`, cutting away whatever older entries it covers.
    /// Padding records carry no range and are ignored.
    pub fn add(&mut self, rec: IndexedDiffRecord) -> Result<()> {
        if rec.is_padding() || rec.io_blocks == 0 {
            return Ok(());
        }
        overlap::cut_overlaps(&mut self.index, &rec, self.max_io_blocks)?;
        self.index.insert(rec.io_address, rec);
        Ok(())
    }

    /// Verify the sorted, non-overlapping invariant.
    pub fn check_no_overlapped_and_sorted(&self) -> Result<()> {
        overlap::check_sorted(&self.index)
    }

    /// All entries in address order.
    pub fn get_as_vec(&self) -> Vec<IndexedDiffRecord> {
        self.index.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedDiffRecord> {
        self.index.values()
    }

    /// Entry covering `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<&IndexedDiffRecord> {
        self.index
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| addr < r.end_io_address())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.index.clear();
    }

    /// Serialize every entry in address order with a fresh record checksum.
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<u64> {
        let mut n = 0u64;
        for rec in self.index.values() {
            let b = rec.encode();
            w.write_all(&b)?;
            n += b.len() as u64;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::config::blocks_to_bytes;

    fn normal(addr: u64, blocks: u32, offset: u64) -> IndexedDiffRecord {
        let mut r = IndexedDiffRecord::normal(addr, blocks, &vec![0u8; blocks_to_bytes(blocks)]);
        r.data_offset = offset;
        r
    }

    fn shape(m: &DiffIndexMem) -> Vec<(u64, u32, u64, u32)> {
        m.iter()
            .map(|r| (r.io_address, r.io_blocks, r.data_offset, r.io_offset))
            .collect()
    }

    #[test]
    fn overlap_resolution_last_writer_wins() {
        let mut m = DiffIndexMem::new(0);
        m.add(normal(100, 4, 1000)).unwrap();
        m.add(normal(102, 2, 2000)).unwrap();
        m.check_no_overlapped_and_sorted().unwrap();
        assert_eq!(shape(&m), vec![(100, 2, 1000, 0), (102, 2, 2000, 0)]);
        assert_eq!(m.lookup(103).unwrap().data_offset, 2000);
        assert_eq!(m.lookup(101).unwrap().data_offset, 1000);
        assert!(m.lookup(104).is_none());
    }

    #[test]
    fn covering_write_replaces_several_entries() {
        let mut m = DiffIndexMem::new(0);
        m.add(normal(0, 2, 10)).unwrap();
        m.add(normal(4, 2, 20)).unwrap();
        m.add(normal(8, 2, 30)).unwrap();
        m.add(IndexedDiffRecord::discard(1, 8)).unwrap();
        assert_eq!(m.len(), 3);
        let v = m.get_as_vec();
        assert_eq!((v[0].io_address, v[0].io_blocks), (0, 1));
        assert!(v[1].is_discard());
        assert_eq!((v[2].io_address, v[2].io_blocks, v[2].io_offset), (9, 1, 1));
    }

    #[test]
    fn fragments_are_split_to_cap() {
        let mut m = DiffIndexMem::new(2);
        m.add(normal(0, 4, 0)).unwrap();
        m.add(IndexedDiffRecord::all_zero(4, 1)).unwrap();
        m.add(normal(10, 7, 4096)).unwrap();
        // The new record is stored whole; only leftovers get split.
        assert_eq!(m.lookup(10).unwrap().io_blocks, 7);
        m.add(IndexedDiffRecord::all_zero(16, 1)).unwrap();
        assert_eq!(
            &shape(&m)[2..5],
            &[(10, 2, 4096, 0), (12, 2, 4096, 2), (14, 2, 4096, 4)]
        );
        m.check_no_overlapped_and_sorted().unwrap();
    }

    #[test]
    fn padding_is_ignored_and_clear_empties() {
        let mut m = DiffIndexMem::default();
        let mut pad = IndexedDiffRecord::default();
        pad.flags = crate::diff::record::RecordFlags::for_kind(
            crate::diff::record::RecordKind::Padding,
        );
        m.add(pad).unwrap();
        assert!(m.is_empty());
        m.add(normal(0, 1, 0)).unwrap();
        assert!(!m.is_empty());
        m.clear();
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn write_to_emits_fixed_size_records() {
        let mut m = DiffIndexMem::default();
        m.add(normal(5, 1, 0)).unwrap();
        m.add(normal(1, 1, 512)).unwrap();
        let mut out = Vec::new();
        assert_eq!(m.write_to(&mut out).unwrap(), 96);
        let first = IndexedDiffRecord::decode(&out[..48]).unwrap();
        assert_eq!(first.io_address, 1);
    }
}
