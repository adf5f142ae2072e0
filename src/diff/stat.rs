// Per-kind IO counters for diff streams.

use std::fmt;

use crate::diff::config::blocks_to_bytes;
use crate::diff::indexed_record::IndexedDiffRecord;
use crate::diff::record::{DiffRecord, RecordKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStatistics {
    /// Number of diff files aggregated.
    pub wdiff_nr: u64,
    pub normal_nr: u64,
    pub all_zero_nr: u64,
    pub discard_nr: u64,
    /// Logical blocks per kind.
    pub normal_lb: u64,
    pub all_zero_lb: u64,
    pub discard_lb: u64,
    /// Stored payload bytes (compressed size when compressed).
    pub data_size: u64,
}

impl DiffStatistics {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn count(&mut self, kind: RecordKind, io_blocks: u32, data_size: u32) {
        let lb = u64::from(io_blocks);
        match kind {
            RecordKind::Normal => {
                self.normal_nr += 1;
                self.normal_lb += lb;
            }
            RecordKind::AllZero => {
                self.all_zero_nr += 1;
                self.all_zero_lb += lb;
            }
            RecordKind::Discard => {
                self.discard_nr += 1;
                self.discard_lb += lb;
            }
            RecordKind::Padding => return,
        }
        self.data_size += u64::from(data_size);
    }

    pub fn update(&mut self, rec: &DiffRecord) {
        self.count(rec.kind(), rec.io_blocks, rec.data_size);
    }

    /// Indexed records sharing one payload would count it twice, so only
    /// the record's share in blocks is added to `data_size` when uncompressed.
    pub fn update_indexed(&mut self, rec: &IndexedDiffRecord) {
        let share = if rec.is_compressed() {
            rec.data_size
        } else if rec.is_normal() {
            blocks_to_bytes(rec.io_blocks) as u32
        } else {
            0
        };
        self.count(rec.kind(), rec.io_blocks, share);
    }

    pub fn merge(&mut self, other: &Self) {
        self.wdiff_nr += other.wdiff_nr;
        self.normal_nr += other.normal_nr;
        self.all_zero_nr += other.all_zero_nr;
        self.discard_nr += other.discard_nr;
        self.normal_lb += other.normal_lb;
        self.all_zero_lb += other.all_zero_lb;
        self.discard_lb += other.discard_lb;
        self.data_size += other.data_size;
    }

    pub fn total_ios(&self) -> u64 {
        self.normal_nr + self.all_zero_nr + self.discard_nr
    }

    pub fn total_lb(&self) -> u64 {
        self.normal_lb + self.all_zero_lb + self.discard_lb
    }
}

impl fmt::Display for DiffStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wdiffNr {}  nrN {} nrZ {} nrD {}  lbN {} lbZ {} lbD {}  dataSize {}",
            self.wdiff_nr,
            self.normal_nr,
            self.all_zero_nr,
            self.discard_nr,
            self.normal_lb,
            self.all_zero_lb,
            self.discard_lb,
            self.data_size
        )
    }
}
