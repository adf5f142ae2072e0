// K-way merge of diff streams, oldest first, newest wins on overlap.
//
// Each input is sorted and non-overlapping on its own. A stream's front
// record moves into the staging `DiffMemory` only when every older stream's
// front lies at or beyond that record's end, so anything older it overlaps
// has already been staged and gets cut. Staged records that end at or below
// the lowest live front can no longer change and are emitted in address
// order.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use bytes::Bytes;
use log::{debug, info};

use crate::diff::cache::IndexedDiffCache;
use crate::diff::config::CompressOptions;
use crate::diff::header::{DiffFileHeader, DiffFileType};
use crate::diff::indexed::IndexedDiffReader;
use crate::diff::memory::{DiffMemory, DiffRecIo};
use crate::diff::sorted::{SortedDiffReader, SortedDiffWriter};
use crate::diff::stat::DiffStatistics;
use crate::error::{DiffError, Result};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One input of the merger: yields uncompressed records in address order.
pub trait DiffSource {
    fn header(&self) -> &DiffFileHeader;

    /// Next record with its uncompressed IO; `None` at end of stream.
    fn next_rec_io(&mut self, cache: &mut IndexedDiffCache) -> Result<Option<DiffRecIo>>;

    fn stat(&self) -> &DiffStatistics;
}

/// Sorted diff as a merge input.
pub struct SortedDiffStream<R: Read> {
    reader: SortedDiffReader<R>,
    header: DiffFileHeader,
}

impl<R: Read> SortedDiffStream<R> {
    /// Wrap `reader`, reading its header first if that has not happened.
    pub fn new(mut reader: SortedDiffReader<R>) -> Result<Self> {
        let header = match reader.header() {
            Some(h) => *h,
            None => reader.read_header()?,
        };
        Ok(Self { reader, header })
    }
}

impl<R: Read> DiffSource for SortedDiffStream<R> {
    fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    fn next_rec_io(&mut self, _cache: &mut IndexedDiffCache) -> Result<Option<DiffRecIo>> {
        match self.reader.read_and_uncompress_diff(false)? {
            Some((rec, io)) => Ok(Some(DiffRecIo::new(rec, Bytes::from(io))?)),
            None => Ok(None),
        }
    }

    fn stat(&self) -> &DiffStatistics {
        self.reader.stat()
    }
}

/// Indexed diff as a merge input, walked in index order.
pub struct IndexedDiffStream {
    reader: IndexedDiffReader,
}

impl IndexedDiffStream {
    pub fn new(reader: IndexedDiffReader) -> Self {
        Self { reader }
    }
}

impl DiffSource for IndexedDiffStream {
    fn header(&self) -> &DiffFileHeader {
        self.reader.header()
    }

    fn next_rec_io(&mut self, cache: &mut IndexedDiffCache) -> Result<Option<DiffRecIo>> {
        match self.reader.read_diff(cache)? {
            Some((rec, io)) => Ok(Some(DiffRecIo::from_indexed(&rec, io)?)),
            None => Ok(None),
        }
    }

    fn stat(&self) -> &DiffStatistics {
        self.reader.stat()
    }
}

/// Open a diff file of either format, telling them apart by the header.
pub fn open_diff_source<P: AsRef<Path>>(path: P) -> Result<Box<dyn DiffSource>> {
    let path = path.as_ref();
    let mut r = BufReader::new(File::open(path)?);
    let header = DiffFileHeader::read_from(&mut r)?;
    match header.file_type {
        DiffFileType::Sorted => {
            let reader = SortedDiffReader::with_header(r, header)?;
            Ok(Box::new(SortedDiffStream::new(reader)?))
        }
        DiffFileType::Indexed => {
            drop(r);
            Ok(Box::new(IndexedDiffStream::new(IndexedDiffReader::open(
                path,
            )?)))
        }
    }
}

// ---------------------------------------------------------------------------
// Merger
// ---------------------------------------------------------------------------

struct Wdiff {
    src: Box<dyn DiffSource>,
    front: Option<DiffRecIo>,
    ended: bool,
}

impl Wdiff {
    fn new(src: Box<dyn DiffSource>) -> Self {
        Self {
            src,
            front: None,
            ended: false,
        }
    }

    fn fill(&mut self, cache: &mut IndexedDiffCache) -> Result<()> {
        if self.ended || self.front.is_some() {
            return Ok(());
        }
        match self.src.next_rec_io(cache)? {
            Some(r) => self.front = Some(r),
            None => self.ended = true,
        }
        Ok(())
    }

    /// Front address, `u64::MAX` once ended.
    fn current_address(&self) -> u64 {
        self.front
            .as_ref()
            .map_or(u64::MAX, |r| r.record().io_address)
    }

    fn pop(&mut self, cache: &mut IndexedDiffCache) -> Result<Option<DiffRecIo>> {
        let Some(r) = self.front.take() else {
            return Ok(None);
        };
        self.fill(cache)?;
        let end = r.record().end_io_address();
        if let Some(next) = &self.front
            && next.record().io_address < end
        {
            return Err(DiffError::sequence(format!(
                "wdiff records must be sorted and disjoint: {} follows [{}, {end})",
                next.record().io_address,
                r.record().io_address
            )));
        }
        Ok(Some(r))
    }
}

pub struct DiffMerger {
    /// Oldest first.
    wdiffs: Vec<Wdiff>,
    mem: DiffMemory,
    merged: VecDeque<DiffRecIo>,
    cache: IndexedDiffCache,
    header: DiffFileHeader,
    max_io_blocks: u32,
    should_validate_uuid: bool,
    prepared: bool,
    stat_in: DiffStatistics,
    stat_out: DiffStatistics,
}

impl Default for DiffMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffMerger {
    pub fn new() -> Self {
        Self {
            wdiffs: Vec::new(),
            mem: DiffMemory::default(),
            merged: VecDeque::new(),
            cache: IndexedDiffCache::default(),
            header: DiffFileHeader::default(),
            max_io_blocks: 0,
            should_validate_uuid: false,
            prepared: false,
            stat_in: DiffStatistics::default(),
            stat_out: DiffStatistics::default(),
        }
    }

    /// Cap output IOs at `n` blocks. 0 takes the largest cap among inputs.
    pub fn set_max_io_blocks(&mut self, n: u32) {
        self.max_io_blocks = n;
    }

    pub fn set_should_validate_uuid(&mut self, b: bool) {
        self.should_validate_uuid = b;
    }

    /// Budget of the payload cache shared by indexed inputs.
    pub fn set_cache_bytes(&mut self, n: usize) {
        self.cache.set_max_bytes(n);
    }

    /// Append a stream newer than every stream added so far.
    pub fn add_wdiff(&mut self, src: Box<dyn DiffSource>) -> Result<()> {
        if self.prepared {
            return Err(DiffError::ProtocolState("wdiff added after prepare"));
        }
        self.wdiffs.push(Wdiff::new(src));
        Ok(())
    }

    /// Append streams, oldest first.
    pub fn add_wdiffs<I>(&mut self, srcs: I) -> Result<()>
    where
        I: IntoIterator<Item = Box<dyn DiffSource>>,
    {
        for s in srcs {
            self.add_wdiff(s)?;
        }
        Ok(())
    }

    /// Open and append a diff file of either format.
    pub fn add_wdiff_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let src = open_diff_source(path)?;
        self.add_wdiff(src)
    }

    pub fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    /// Input counters of the streams consumed so far.
    pub fn stat_in(&self) -> &DiffStatistics {
        &self.stat_in
    }

    /// Output counters of the last `merge_to`.
    pub fn stat_out(&self) -> &DiffStatistics {
        &self.stat_out
    }

    /// Build the output header and prime every stream. Idempotent.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        let Some(newest) = self.wdiffs.last() else {
            return Err(DiffError::InvalidArgument("no wdiffs to merge".into()));
        };
        let uuid = newest.src.header().uuid;
        if self.should_validate_uuid {
            for w in &self.wdiffs {
                let u = w.src.header().uuid;
                if u != uuid {
                    return Err(DiffError::format(format!("uuid differs: {u} vs {uuid}")));
                }
            }
        }
        let max_io_blocks = if self.max_io_blocks == 0 {
            self.wdiffs
                .iter()
                .map(|w| w.src.header().max_io_blocks)
                .max()
                .unwrap_or(0)
        } else {
            self.max_io_blocks
        };
        self.header = DiffFileHeader::new(DiffFileType::Sorted, uuid);
        self.header.set_max_io_blocks_if_necessary(max_io_blocks);
        self.mem = DiffMemory::new(max_io_blocks);

        for w in &mut self.wdiffs {
            w.fill(&mut self.cache)?;
        }
        self.remove_ended();
        self.prepared = true;
        debug!(
            "merge: {} live wdiffs, max io blocks {max_io_blocks}",
            self.wdiffs.len()
        );
        Ok(())
    }

    /// Next merged record in address order; `None` when every input is
    /// exhausted.
    pub fn get_and_remove(&mut self) -> Result<Option<DiffRecIo>> {
        self.prepare()?;
        loop {
            if let Some(r) = self.merged.pop_front() {
                return Ok(Some(r));
            }
            if self.wdiffs.is_empty() && self.mem.is_empty() {
                return Ok(None);
            }
            self.move_to_memory()?;
            self.move_to_merged();
        }
    }

    /// Merge everything into a sorted wdiff written to `w`.
    pub fn merge_to<W: Write>(&mut self, w: W, opts: CompressOptions) -> Result<W> {
        self.prepare()?;
        let mut writer = SortedDiffWriter::new(w);
        let mut header = self.header;
        writer.write_header(&mut header)?;
        while let Some(r) = self.get_and_remove()? {
            writer.compress_and_write_diff(&r.record_with_checksum(), r.io(), opts)?;
        }
        writer.close()?;
        self.stat_out = *writer.stat();
        info!(
            "merged {} wdiffs: {} ios in, {} ios out",
            self.stat_in.wdiff_nr,
            self.stat_in.total_ios(),
            self.stat_out.total_ios()
        );
        writer.finish()
    }

    fn move_to_memory(&mut self) -> Result<()> {
        let floor = self.min_front();
        let mut n = self.merge_round(Some(floor))?;
        if n == 0 && !self.wdiffs.is_empty() {
            // Fronts are tangled; take one record per eligible stream.
            n = self.merge_round(None)?;
        }
        self.remove_ended();
        if n == 0 && !self.wdiffs.is_empty() {
            return Err(DiffError::sequence("merge made no progress"));
        }
        Ok(())
    }

    /// Stage eligible fronts, oldest stream first. With a limit, a stream
    /// keeps going while its front starts at or below it; without, each
    /// stream contributes at most one record.
    fn merge_round(&mut self, limit: Option<u64>) -> Result<usize> {
        let mut n = 0;
        let mut older_min = u64::MAX;
        for w in &mut self.wdiffs {
            while let Some(front) = &w.front {
                let rec = front.record();
                let eligible = rec.end_io_address() <= older_min
                    && limit.is_none_or(|l| rec.io_address <= l);
                if !eligible {
                    break;
                }
                let Some(r) = w.pop(&mut self.cache)? else {
                    break;
                };
                self.mem.add(r)?;
                n += 1;
                if limit.is_none() {
                    break;
                }
            }
            older_min = older_min.min(w.current_address());
        }
        Ok(n)
    }

    fn move_to_merged(&mut self) {
        let done = self.min_front();
        while let Some(r) = self.mem.front() {
            if r.record().end_io_address() > done {
                break;
            }
            if let Some(r) = self.mem.pop_front() {
                self.merged.push_back(r);
            }
        }
    }

    fn min_front(&self) -> u64 {
        self.wdiffs
            .iter()
            .map(Wdiff::current_address)
            .min()
            .unwrap_or(u64::MAX)
    }

    fn remove_ended(&mut self) {
        let stat_in = &mut self.stat_in;
        self.wdiffs.retain(|w| {
            if w.ended {
                stat_in.merge(w.src.stat());
            }
            !w.ended
        });
    }
}
