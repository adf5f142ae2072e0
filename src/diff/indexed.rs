// Indexed diff format: append-only payloads plus a trailing index.
//
//   [DiffFileHeader][payload region][pad to 8][IndexedDiffRecord]*[DiffIndexSuper]
//
// The writer streams payloads sequentially and keeps the overlap-resolved
// index in memory until `finalize`. The reader needs random access: it
// locates the super block at EOF, walks the index linearly and resolves
// payloads by absolute offset through an `IndexedDiffCache`.

use std::fs::File;
use std::io::{Seek, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use log::{debug, warn};
use memmap2::Mmap;

use crate::block::BlockBuffer;
use crate::checksum::calc_checksum;
use crate::compress;
use crate::diff::cache::{CacheKey, IndexedDiffCache};
use crate::diff::config::{CompressOptions, DEFAULT_MAX_IO_BLOCKS, blocks_to_bytes};
use crate::diff::header::{
    DiffFileHeader, DiffFileType, DiffIndexSuper, FILE_HEADER_SIZE, INDEX_SUPER_SIZE,
};
use crate::diff::index_mem::DiffIndexMem;
use crate::diff::indexed_record::{INDEXED_RECORD_SIZE, IndexedDiffRecord};
use crate::diff::stat::DiffStatistics;
use crate::error::{DiffError, Result};

const INDEX_ALIGN: u64 = 8;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct IndexedDiffWriter<W: Write> {
    inner: Option<W>,
    index: DiffIndexMem,
    offset: u64,
    n_data: u64,
    header_written: bool,
    closed: bool,
}

impl<W: Write> IndexedDiffWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_max_io_blocks(inner, DEFAULT_MAX_IO_BLOCKS)
    }

    /// `max_io_blocks` caps index fragments; 0 disables splitting.
    pub fn with_max_io_blocks(inner: W, max_io_blocks: u32) -> Self {
        Self {
            inner: Some(inner),
            index: DiffIndexMem::new(max_io_blocks),
            offset: 0,
            n_data: 0,
            header_written: false,
            closed: false,
        }
    }

    fn sink(&mut self) -> Result<&mut W> {
        self.inner
            .as_mut()
            .ok_or(DiffError::ProtocolState("writer already finished"))
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(DiffError::ProtocolState("write after close"));
        }
        if !self.header_written {
            return Err(DiffError::ProtocolState("write before header"));
        }
        Ok(())
    }

    /// Write the file header. Sets its type to indexed.
    pub fn write_header(&mut self, header: &mut DiffFileHeader) -> Result<()> {
        if self.closed {
            return Err(DiffError::ProtocolState("write after close"));
        }
        if self.header_written {
            return Err(DiffError::ProtocolState("header written twice"));
        }
        header.file_type = DiffFileType::Indexed;
        header.write_to(self.sink()?)?;
        self.offset = FILE_HEADER_SIZE as u64;
        self.header_written = true;
        Ok(())
    }

    /// Append `data` (the stored payload, empty unless Normal), stamp
    /// `data_offset` and index the record.
    pub fn write_diff(&mut self, rec: &IndexedDiffRecord, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        rec.verify()?;
        if data.len() != rec.data_size as usize {
            return Err(DiffError::InvalidArgument(format!(
                "payload is {} bytes, record says {}",
                data.len(),
                rec.data_size
            )));
        }
        let mut rec = *rec;
        if rec.is_normal() {
            if !rec.is_compressed() {
                let actual = calc_checksum(data, 0);
                if actual != rec.io_checksum {
                    return Err(DiffError::checksum("diff io", rec.io_checksum, actual));
                }
            }
            rec.data_offset = self.offset;
            self.sink()?.write_all(data)?;
            self.offset += data.len() as u64;
            self.n_data += data.len() as u64;
        } else {
            rec.data_offset = 0;
        }
        self.index.add(rec)
    }

    /// Compress an uncompressed Normal payload covering the whole record,
    /// then write it. Other records pass through.
    pub fn compress_and_write_diff(
        &mut self,
        rec: &IndexedDiffRecord,
        data: &[u8],
        opts: CompressOptions,
    ) -> Result<()> {
        if !rec.is_normal() || rec.is_compressed() {
            return self.write_diff(rec, data);
        }
        if data.len() != blocks_to_bytes(rec.io_blocks) {
            return Err(DiffError::InvalidArgument(format!(
                "{} bytes for {} blocks",
                data.len(),
                rec.io_blocks
            )));
        }
        let (kind, stored) = compress::compress_data(opts.kind, opts.level, data)?;
        let mut out = *rec;
        out.orig_blocks = rec.io_blocks;
        out.io_offset = 0;
        out.io_checksum = calc_checksum(data, 0);
        out.compression_type = kind;
        out.data_size = stored.len() as u32;
        self.write_diff(&out, &stored)
    }

    /// Write a record whose uncompressed payload lives in block storage.
    pub fn write_diff_blocks<B: BlockBuffer + ?Sized>(
        &mut self,
        rec: &IndexedDiffRecord,
        blocks: &B,
        opts: CompressOptions,
    ) -> Result<()> {
        if !rec.is_normal() {
            return self.write_diff(rec, &[]);
        }
        self.compress_and_write_diff(rec, &blocks.to_vec(), opts)
    }

    /// Write index and super block. Idempotent.
    pub fn finalize(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.header_written {
            return Ok(());
        }
        self.index.check_no_overlapped_and_sorted()?;

        let pad = ((INDEX_ALIGN - self.offset % INDEX_ALIGN) % INDEX_ALIGN) as usize;
        let index_offset = self.offset + pad as u64;
        let super_block = DiffIndexSuper {
            index_offset,
            n_records: self.index.len() as u64,
            n_data: self.n_data,
        };
        let Some(w) = self.inner.as_mut() else {
            return Err(DiffError::ProtocolState("writer already finished"));
        };
        w.write_all(&[0u8; INDEX_ALIGN as usize][..pad])?;
        let index_bytes = self.index.write_to(w)?;
        w.write_all(&super_block.encode())?;
        w.flush()?;
        self.offset = index_offset + index_bytes + INDEX_SUPER_SIZE as u64;
        debug!(
            "indexed diff: finalized {} records, {} data bytes, index at {index_offset}",
            super_block.n_records, super_block.n_data
        );
        Ok(())
    }

    /// Finalize and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.finalize()?;
        self.inner
            .take()
            .ok_or(DiffError::ProtocolState("writer already finished"))
    }

    pub fn index(&self) -> &DiffIndexMem {
        &self.index
    }

    /// Counters over the index as it stands.
    pub fn stat(&self) -> DiffStatistics {
        let mut s = DiffStatistics {
            wdiff_nr: 1,
            ..Default::default()
        };
        for rec in self.index.iter() {
            s.update_indexed(rec);
        }
        s
    }
}

impl<W: Write> Drop for IndexedDiffWriter<W> {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.finalize()
        {
            warn!("indexed diff writer: finalize on drop failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate an id distinguishing one reader's cache entries from another's.
pub fn next_reader_id() -> u64 {
    NEXT_READER_ID.fetch_add(1, Ordering::Relaxed)
}

enum Source {
    Mapped(Mmap),
    Memory(Bytes),
}

impl Source {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => &m[..],
            Self::Memory(b) => &b[..],
        }
    }

    /// Payload bytes; zero-copy for in-memory sources.
    fn payload(&self, start: usize, end: usize) -> Bytes {
        match self {
            Self::Mapped(m) => Bytes::copy_from_slice(&m[start..end]),
            Self::Memory(b) => b.slice(start..end),
        }
    }
}

/// Random-access reader for indexed diffs.
pub struct IndexedDiffReader {
    id: u64,
    src: Source,
    header: DiffFileHeader,
    super_block: DiffIndexSuper,
    cursor: u64,
    index_end: u64,
    stat: DiffStatistics,
}

impl IndexedDiffReader {
    /// Open and memory-map a file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file(File::open(path)?)
    }

    /// Memory-map an open file. Pipes, sockets and other sources that
    /// cannot seek are rejected.
    pub fn from_file(mut file: File) -> Result<Self> {
        if let Err(e) = file.stream_position() {
            return Err(DiffError::UnsupportedSource(format!(
                "indexed diff needs a seekable file: {e}"
            )));
        }
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(DiffError::UnsupportedSource(
                "indexed diff needs a regular file".into(),
            ));
        }
        if (meta.len() as usize) < FILE_HEADER_SIZE + INDEX_SUPER_SIZE {
            return Err(DiffError::truncated(format!(
                "indexed diff of {} bytes is too short",
                meta.len()
            )));
        }
        // SAFETY: the mapping is read-only; diff files are not modified
        // while a reader holds them.
        let map = unsafe { Mmap::map(&file)? };
        Self::from_source(Source::Mapped(map))
    }

    /// Read from an in-memory image of a file.
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        Self::from_source(Source::Memory(data.into()))
    }

    fn from_source(src: Source) -> Result<Self> {
        let buf = src.as_slice();
        let len = buf.len() as u64;
        if (len as usize) < FILE_HEADER_SIZE + INDEX_SUPER_SIZE {
            return Err(DiffError::truncated(format!(
                "indexed diff of {len} bytes is too short"
            )));
        }
        let header = DiffFileHeader::decode(&buf[..FILE_HEADER_SIZE])?;
        if header.file_type != DiffFileType::Indexed {
            return Err(DiffError::format(format!(
                "expected an indexed diff, found {}",
                header.file_type
            )));
        }
        let super_off = len - INDEX_SUPER_SIZE as u64;
        let super_block = DiffIndexSuper::decode(&buf[super_off as usize..])?;
        let io = super_block.index_offset;
        if io < FILE_HEADER_SIZE as u64 || io > super_off || io % INDEX_ALIGN != 0 {
            return Err(DiffError::format(format!(
                "index offset {io} outside [{FILE_HEADER_SIZE}, {super_off}] or unaligned"
            )));
        }
        let index_len = super_off - io;
        if index_len % INDEXED_RECORD_SIZE as u64 != 0 {
            return Err(DiffError::format(format!(
                "index region of {index_len} bytes is not a whole number of records"
            )));
        }
        if index_len / INDEXED_RECORD_SIZE as u64 != super_block.n_records {
            return Err(DiffError::format(format!(
                "index holds {} records, super block says {}",
                index_len / INDEXED_RECORD_SIZE as u64,
                super_block.n_records
            )));
        }
        Ok(Self {
            id: next_reader_id(),
            src,
            header,
            super_block,
            cursor: io,
            index_end: super_off,
            stat: DiffStatistics {
                wdiff_nr: 1,
                ..Default::default()
            },
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    pub fn super_block(&self) -> &DiffIndexSuper {
        &self.super_block
    }

    pub fn n_records(&self) -> u64 {
        self.super_block.n_records
    }

    /// Next index record in address order; `None` past the last one.
    pub fn read_diff_record(&mut self) -> Result<Option<IndexedDiffRecord>> {
        if self.cursor >= self.index_end {
            return Ok(None);
        }
        let start = self.cursor as usize;
        let rec =
            IndexedDiffRecord::decode(&self.src.as_slice()[start..start + INDEXED_RECORD_SIZE])?;
        rec.verify()?;
        if rec.is_normal() {
            self.payload_range(&rec)?;
        }
        self.cursor += INDEXED_RECORD_SIZE as u64;
        self.stat.update_indexed(&rec);
        Ok(Some(rec))
    }

    /// Restart the index walk.
    pub fn rewind(&mut self) {
        self.cursor = self.super_block.index_offset;
        self.stat = DiffStatistics {
            wdiff_nr: 1,
            ..Default::default()
        };
    }

    /// Byte range of `rec`'s stored payload; it must sit between the file
    /// header and the index.
    fn payload_range(&self, rec: &IndexedDiffRecord) -> Result<(usize, usize)> {
        let start = rec.data_offset;
        let limit = self.super_block.index_offset;
        match start.checked_add(u64::from(rec.data_size)) {
            Some(end) if start >= FILE_HEADER_SIZE as u64 && end <= limit => {
                Ok((start as usize, end as usize))
            }
            _ => Err(DiffError::format(format!(
                "payload at {start} of {} bytes outside the data region [{FILE_HEADER_SIZE}, {limit})",
                rec.data_size
            ))),
        }
    }

    fn key(&self, rec: &IndexedDiffRecord) -> CacheKey {
        CacheKey::new(self.id, rec.data_offset)
    }

    pub fn is_on_cache(&self, rec: &IndexedDiffRecord, cache: &IndexedDiffCache) -> bool {
        cache.contains(&self.key(rec))
    }

    /// Load and decompress the payload `rec` points into, verify it and
    /// insert it into `cache`. Returns the whole uncompressed payload.
    pub fn load_to_cache(
        &self,
        rec: &IndexedDiffRecord,
        cache: &mut IndexedDiffCache,
    ) -> Result<Bytes> {
        let (start, end) = self.payload_range(rec)?;
        let stored = self.src.payload(start, end);
        let size = blocks_to_bytes(rec.orig_blocks);
        let data = if rec.is_compressed() {
            Bytes::from(compress::uncompress_data(rec.compression_type, &stored, size)?)
        } else {
            if stored.len() != size {
                return Err(DiffError::format(format!(
                    "uncompressed payload is {} bytes, expected {size}",
                    stored.len()
                )));
            }
            stored
        };
        let actual = calc_checksum(&data, 0);
        if actual != rec.io_checksum {
            return Err(DiffError::checksum("diff io", rec.io_checksum, actual));
        }
        cache.add(self.key(rec), data.clone())?;
        Ok(data)
    }

    /// The uncompressed bytes of `rec`'s own block range. Empty for
    /// non-Normal records.
    pub fn read_diff_io(
        &self,
        rec: &IndexedDiffRecord,
        cache: &mut IndexedDiffCache,
    ) -> Result<Bytes> {
        if !rec.is_normal() {
            return Ok(Bytes::new());
        }
        let whole = match cache.find(&self.key(rec)) {
            Some(b) => b,
            None => self.load_to_cache(rec, cache)?,
        };
        let start = blocks_to_bytes(rec.io_offset);
        let end = start + blocks_to_bytes(rec.io_blocks);
        if end > whole.len() {
            return Err(DiffError::format(format!(
                "record window [{start}, {end}) exceeds {}-byte payload",
                whole.len()
            )));
        }
        Ok(whole.slice(start..end))
    }

    /// Next record together with its uncompressed IO bytes.
    pub fn read_diff(
        &mut self,
        cache: &mut IndexedDiffCache,
    ) -> Result<Option<(IndexedDiffRecord, Bytes)>> {
        let Some(rec) = self.read_diff_record()? else {
            return Ok(None);
        };
        let io = self.read_diff_io(&rec, cache)?;
        Ok(Some((rec, io)))
    }

    /// Counters for records returned so far.
    pub fn stat(&self) -> &DiffStatistics {
        &self.stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::config::LOGICAL_BLOCK_SIZE;

    fn payload(blocks: u32, seed: u8) -> Vec<u8> {
        (0..blocks_to_bytes(blocks))
            .map(|i| (i as u8).wrapping_add(seed))
            .collect()
    }

    fn write_sample() -> Vec<u8> {
        let mut w = IndexedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        let a = payload(4, 1);
        w.write_diff(&IndexedDiffRecord::normal(100, 4, &a), &a)
            .unwrap();
        let b = payload(2, 2);
        w.write_diff(&IndexedDiffRecord::normal(102, 2, &b), &b)
            .unwrap();
        w.write_diff(&IndexedDiffRecord::discard(0, 8), &[]).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn layout_and_alignment() {
        let buf = write_sample();
        let r = IndexedDiffReader::from_bytes(buf.clone()).unwrap();
        let sb = *r.super_block();
        assert_eq!(sb.index_offset % 8, 0);
        assert_eq!(sb.n_records, 3);
        assert_eq!(sb.n_data, 6 * LOGICAL_BLOCK_SIZE as u64);
        assert_eq!(
            buf.len() as u64,
            sb.index_offset + 3 * INDEXED_RECORD_SIZE as u64 + INDEX_SUPER_SIZE as u64
        );
    }

    #[test]
    fn overlapping_writes_resolve_in_file() {
        let buf = write_sample();
        let mut r = IndexedDiffReader::from_bytes(buf).unwrap();
        let mut cache = IndexedDiffCache::new(1 << 20);
        let mut got = Vec::new();
        while let Some((rec, io)) = r.read_diff(&mut cache).unwrap() {
            got.push((rec.io_address, rec.io_blocks, io));
        }
        assert_eq!(got.len(), 3);
        assert_eq!((got[0].0, got[0].1), (0, 8));
        assert!(got[0].2.is_empty());
        assert_eq!((got[1].0, got[1].1), (100, 2));
        assert_eq!(&got[1].2[..], &payload(4, 1)[..1024]);
        assert_eq!(&got[2].2[..], &payload(2, 2)[..]);
    }

    #[test]
    fn cache_hit_reuses_payload() {
        let buf = write_sample();
        let mut r = IndexedDiffReader::from_bytes(buf).unwrap();
        let mut cache = IndexedDiffCache::new(1 << 20);
        r.read_diff_record().unwrap();
        let rec = r.read_diff_record().unwrap().unwrap();
        assert!(!r.is_on_cache(&rec, &cache));
        let first = r.read_diff_io(&rec, &mut cache).unwrap();
        assert!(r.is_on_cache(&rec, &cache));
        let again = r.read_diff_io(&rec, &mut cache).unwrap();
        assert_eq!(first, again);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rejects_sorted_file_and_short_input() {
        let mut h = DiffFileHeader::default();
        let mut bytes = h.encode().to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            IndexedDiffReader::from_bytes(bytes),
            Err(DiffError::Format(_))
        ));
        h.file_type = DiffFileType::Indexed;
        assert!(matches!(
            IndexedDiffReader::from_bytes(h.encode().to_vec()),
            Err(DiffError::Truncated(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut buf = write_sample();
        buf[FILE_HEADER_SIZE + 3] ^= 0x80;
        let mut r = IndexedDiffReader::from_bytes(buf).unwrap();
        let mut cache = IndexedDiffCache::default();
        r.read_diff_record().unwrap();
        let rec = r.read_diff_record().unwrap().unwrap();
        assert!(matches!(
            r.read_diff_io(&rec, &mut cache),
            Err(DiffError::Checksum { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn corrupted_super_block_is_checksum_error() {
        let mut buf = write_sample();
        let n = buf.len();
        buf[n - 20] ^= 1;
        assert!(matches!(
            IndexedDiffReader::from_bytes(buf),
            Err(DiffError::Checksum { .. })
        ));
    }

    #[test]
    fn writer_state_errors() {
        let mut w = IndexedDiffWriter::new(Vec::new());
        assert!(matches!(
            w.write_diff(&IndexedDiffRecord::discard(0, 1), &[]),
            Err(DiffError::ProtocolState(_))
        ));
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        assert!(matches!(
            w.write_header(&mut DiffFileHeader::default()),
            Err(DiffError::ProtocolState(_))
        ));
        let d = payload(1, 0);
        let mut rec = IndexedDiffRecord::normal(0, 1, &d);
        rec.io_checksum ^= 1;
        assert!(matches!(
            w.write_diff(&rec, &d),
            Err(DiffError::Checksum { .. })
        ));
        w.finalize().unwrap();
        w.finalize().unwrap();
        assert!(matches!(
            w.write_diff(&IndexedDiffRecord::discard(0, 1), &[]),
            Err(DiffError::ProtocolState(_))
        ));
    }

    #[test]
    fn empty_diff_is_readable() {
        let mut w = IndexedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        let buf = w.finish().unwrap();
        let mut r = IndexedDiffReader::from_bytes(buf).unwrap();
        assert_eq!(r.n_records(), 0);
        assert!(r.read_diff_record().unwrap().is_none());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn compressed_payload_roundtrip() {
        use crate::compress::CompressionType;
        let data = vec![0x42u8; blocks_to_bytes(16)];
        let mut w = IndexedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        let opts = CompressOptions {
            kind: CompressionType::Gzip,
            level: 6,
        };
        w.compress_and_write_diff(&IndexedDiffRecord::normal(0, 16, &data), &data, opts)
            .unwrap();
        // Overwrite the middle so the compressed payload is shared by two
        // fragments.
        w.write_diff(&IndexedDiffRecord::all_zero(4, 4), &[]).unwrap();
        let buf = w.finish().unwrap();

        let mut r = IndexedDiffReader::from_bytes(buf).unwrap();
        let mut cache = IndexedDiffCache::default();
        let mut total = 0;
        while let Some((rec, io)) = r.read_diff(&mut cache).unwrap() {
            if rec.is_normal() {
                assert!(rec.is_compressed());
                assert!(io.iter().all(|&b| b == 0x42));
                total += io.len();
            }
        }
        assert_eq!(total, blocks_to_bytes(12));
        assert_eq!(cache.len(), 1);
    }
}
