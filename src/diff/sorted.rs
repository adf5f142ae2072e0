// Sorted diff format: header, packs, terminal END pack.
//
//   [DiffFileHeader][PackHeader][payloads]...[PackHeader END]
//
// Records are written in ascending, non-overlapping address order. The
// reader streams them back one at a time and never needs to seek.
//
// Termination: the END pack yields `Ok(None)`. Input that stops where a
// pack header or payload is still expected is `DiffError::Truncated`.

use std::io::{Read, Write};

use log::{debug, warn};

use crate::block::BlockBuffer;
use crate::diff::config::{CompressOptions, PACK_HEADER_SIZE, PackLimits};
use crate::diff::header::{DiffFileHeader, DiffFileType};
use crate::diff::pack::{DiffPackHeader, DiffPacker};
use crate::diff::record::DiffRecord;
use crate::diff::stat::DiffStatistics;
use crate::error::{DiffError, Result, read_full, read_full_or_eof};

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Streams records into packs.
///
/// Must be closed (or finished) to emit the END pack; dropping an open
/// writer closes it and only logs failures.
pub struct SortedDiffWriter<W: Write> {
    inner: Option<W>,
    packer: DiffPacker,
    header_written: bool,
    closed: bool,
    last_end: u64,
    stat: DiffStatistics,
}

impl<W: Write> SortedDiffWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_limits(inner, PackLimits::default())
    }

    pub fn with_limits(inner: W, limits: PackLimits) -> Self {
        Self {
            inner: Some(inner),
            packer: DiffPacker::new(limits),
            header_written: false,
            closed: false,
            last_end: 0,
            stat: DiffStatistics {
                wdiff_nr: 1,
                ..Default::default()
            },
        }
    }

    fn sink(&mut self) -> Result<&mut W> {
        self.inner
            .as_mut()
            .ok_or(DiffError::ProtocolState("writer already finished"))
    }

    /// Write the file header. Sets its type to sorted.
    pub fn write_header(&mut self, header: &mut DiffFileHeader) -> Result<()> {
        if self.closed {
            return Err(DiffError::ProtocolState("write after close"));
        }
        if self.header_written {
            return Err(DiffError::ProtocolState("header written twice"));
        }
        header.file_type = DiffFileType::Sorted;
        header.write_to(self.sink()?)?;
        self.header_written = true;
        Ok(())
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

    /// Append one record and its stored payload (empty unless Normal).
    pub fn write_diff(&mut self, rec: &DiffRecord, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        rec.verify()?;
        if !rec.is_padding() && rec.io_address < self.last_end {
            return Err(DiffError::sequence(format!(
                "record at {} overlaps or precedes previous end {}",
                rec.io_address, self.last_end
            )));
        }
        if !self.packer.add(rec, data)? {
            self.write_pack()?;
            if !self.packer.add(rec, data)? {
                return Err(DiffError::sequence("record rejected by an empty pack"));
            }
        }
        if !rec.is_padding() {
            self.last_end = rec.end_io_address();
        }
        Ok(())
    }

    /// Compress an uncompressed Normal payload, then write it. Other records
    /// pass through unchanged.
    pub fn compress_and_write_diff(
        &mut self,
        rec: &DiffRecord,
        data: &[u8],
        opts: CompressOptions,
    ) -> Result<()> {
        let (rec, stored) = rec.compress(data, opts)?;
        self.write_diff(&rec, &stored)
    }

    /// Write a record whose uncompressed payload lives in block storage.
    pub fn write_diff_blocks<B: BlockBuffer + ?Sized>(
        &mut self,
        rec: &DiffRecord,
        blocks: &B,
        opts: CompressOptions,
    ) -> Result<()> {
        if !rec.is_normal() {
            return self.write_diff(rec, &[]);
        }
        self.compress_and_write_diff(rec, &blocks.to_vec(), opts)
    }

    fn write_pack(&mut self) -> Result<()> {
        if self.packer.is_empty() {
            return Ok(());
        }
        for rec in self.packer.header().records() {
            self.stat.update(rec);
        }
        let n = self.packer.header().n_records();
        let bytes = self.packer.take();
        debug!("sorted diff: flushing pack of {n} records ({} bytes)", bytes.len());
        self.sink()?.write_all(&bytes)?;
        Ok(())
    }

    /// Write the pending pack, if any.
    pub fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        self.write_pack()?;
        self.sink()?.flush()?;
        Ok(())
    }

    /// Flush and write the END pack. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.header_written {
            // Nothing was started; leave the sink untouched.
            return Ok(());
        }
        self.write_pack()?;
        let end = DiffPackHeader::end_marker().encode();
        let w = self.sink()?;
        w.write_all(&end)?;
        w.flush()?;
        Ok(())
    }

    /// Close and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        self.inner
            .take()
            .ok_or(DiffError::ProtocolState("writer already finished"))
    }

    /// Counters for records flushed so far.
    pub fn stat(&self) -> &DiffStatistics {
        &self.stat
    }

    pub fn get_ref(&self) -> Option<&W> {
        self.inner.as_ref()
    }
}

impl<W: Write> Drop for SortedDiffWriter<W> {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.close()
        {
            warn!("sorted diff writer: close on drop failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Single-pass reader for sorted diffs.
pub struct SortedDiffReader<R: Read> {
    inner: R,
    header: Option<DiffFileHeader>,
    pack: Option<DiffPackHeader>,
    rec_idx: usize,
    cursor: u64,
    ended: bool,
    stat: DiffStatistics,
}

impl<R: Read> SortedDiffReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: None,
            pack: None,
            rec_idx: 0,
            cursor: 0,
            ended: false,
            stat: DiffStatistics {
                wdiff_nr: 1,
                ..Default::default()
            },
        }
    }

    /// Read and verify the file header. Must be called exactly once, first.
    pub fn read_header(&mut self) -> Result<DiffFileHeader> {
        if self.header.is_some() {
            return Err(DiffError::ProtocolState("header read twice"));
        }
        let header = DiffFileHeader::read_from(&mut self.inner)?;
        if header.file_type != DiffFileType::Sorted {
            return Err(DiffError::format(format!(
                "expected a sorted diff, found {}",
                header.file_type
            )));
        }
        self.header = Some(header);
        Ok(header)
    }

    /// Continue after a header that was already consumed from the source
    /// (e.g. while sniffing the file type).
    pub fn with_header(inner: R, header: DiffFileHeader) -> Result<Self> {
        if header.file_type != DiffFileType::Sorted {
            return Err(DiffError::format(format!(
                "expected a sorted diff, found {}",
                header.file_type
            )));
        }
        let mut r = Self::new(inner);
        r.header = Some(header);
        Ok(r)
    }

    pub fn header(&self) -> Option<&DiffFileHeader> {
        self.header.as_ref()
    }

    /// Advance to a pack with unread records. Returns false at the END pack.
    fn prepare_read(&mut self) -> Result<bool> {
        if self.header.is_none() {
            return Err(DiffError::ProtocolState("read before header"));
        }
        loop {
            if self.ended {
                return Ok(false);
            }
            if let Some(p) = &self.pack
                && self.rec_idx < p.n_records()
            {
                return Ok(true);
            }
            let mut buf = vec![0u8; PACK_HEADER_SIZE];
            if !read_full_or_eof(&mut self.inner, &mut buf, "pack header")? {
                return Err(DiffError::truncated("sorted diff ends without an end pack"));
            }
            let pack = DiffPackHeader::decode(&buf)?;
            if pack.is_end() {
                self.ended = true;
                self.pack = None;
                return Ok(false);
            }
            self.rec_idx = 0;
            self.cursor = 0;
            self.pack = Some(pack);
        }
    }

    /// Next record and its stored payload; `None` at the END pack.
    pub fn read_diff(&mut self) -> Result<Option<(DiffRecord, Vec<u8>)>> {
        loop {
            if !self.prepare_read()? {
                return Ok(None);
            }
            let Some(pack) = &self.pack else {
                return Ok(None);
            };
            let rec = *pack.record(self.rec_idx);
            self.rec_idx += 1;
            if u64::from(rec.data_offset) != self.cursor {
                return Err(DiffError::sequence(format!(
                    "record data offset {} but reader is at {}",
                    rec.data_offset, self.cursor
                )));
            }
            let mut data = vec![0u8; rec.data_size as usize];
            read_full(&mut self.inner, &mut data, "diff io")?;
            self.cursor += u64::from(rec.data_size);
            rec.verify_payload(&data)?;
            if rec.is_padding() {
                continue;
            }
            self.stat.update(&rec);
            return Ok(Some((rec, data)));
        }
    }

    /// Like `read_diff`, but Normal payloads come back uncompressed. The
    /// returned checksum is recomputed when `with_checksum` is set.
    pub fn read_and_uncompress_diff(
        &mut self,
        with_checksum: bool,
    ) -> Result<Option<(DiffRecord, Vec<u8>)>> {
        match self.read_diff()? {
            Some((rec, data)) if rec.is_compressed() => {
                Ok(Some(rec.uncompress(&data, with_checksum)?))
            }
            other => Ok(other),
        }
    }

    pub fn is_end(&self) -> bool {
        self.ended
    }

    /// Counters for records returned so far.
    pub fn stat(&self) -> &DiffStatistics {
        &self.stat
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionType;
    use crate::diff::config::{LOGICAL_BLOCK_SIZE, blocks_to_bytes};
    use crate::diff::header::FILE_HEADER_SIZE;
    use std::io::Cursor;

    fn payload(blocks: u32, seed: u8) -> Vec<u8> {
        (0..blocks_to_bytes(blocks))
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    fn write_sample(limits: PackLimits) -> Vec<u8> {
        let mut w = SortedDiffWriter::with_limits(Vec::new(), limits);
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        let d = payload(2, 1);
        w.write_diff(&DiffRecord::normal(0, 2, &d), &d).unwrap();
        w.write_diff(&DiffRecord::all_zero(2, 8), &[]).unwrap();
        w.write_diff(&DiffRecord::discard(16, 4), &[]).unwrap();
        let d = payload(1, 9);
        w.write_diff(&DiffRecord::normal(20, 1, &d), &d).unwrap();
        w.finish().unwrap()
    }

    fn read_all(buf: &[u8]) -> Vec<(DiffRecord, Vec<u8>)> {
        let mut r = SortedDiffReader::new(Cursor::new(buf));
        r.read_header().unwrap();
        let mut out = Vec::new();
        while let Some(x) = r.read_diff().unwrap() {
            out.push(x);
        }
        assert!(r.is_end());
        out
    }

    #[test]
    fn roundtrip_in_one_pack() {
        let buf = write_sample(PackLimits::default());
        // header + one pack (3 KiB payload) + end pack
        assert_eq!(buf.len(), FILE_HEADER_SIZE + 2 * PACK_HEADER_SIZE + 3 * LOGICAL_BLOCK_SIZE);
        let recs = read_all(&buf);
        assert_eq!(recs.len(), 4);
        assert_eq!(recs[0].1, payload(2, 1));
        assert!(recs[1].0.is_all_zero());
        assert!(recs[2].0.is_discard());
        assert_eq!(recs[3].0.data_offset, 1024);
    }

    #[test]
    fn small_packs_rotate() {
        let limits = PackLimits {
            max_records: 2,
            max_total_size: 1 << 20,
        };
        let buf = write_sample(limits);
        assert_eq!(buf.len(), FILE_HEADER_SIZE + 3 * PACK_HEADER_SIZE + 3 * LOGICAL_BLOCK_SIZE);
        let recs = read_all(&buf);
        assert_eq!(recs.len(), 4);
        assert_eq!(recs[3].0.data_offset, 0);
        assert_eq!(recs[3].1, payload(1, 9));
    }

    #[test]
    fn protocol_state_errors() {
        let mut w = SortedDiffWriter::new(Vec::new());
        let d = payload(1, 0);
        assert!(matches!(
            w.write_diff(&DiffRecord::normal(0, 1, &d), &d),
            Err(DiffError::ProtocolState(_))
        ));
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        assert!(matches!(
            w.write_header(&mut DiffFileHeader::default()),
            Err(DiffError::ProtocolState(_))
        ));
        w.close().unwrap();
        w.close().unwrap();
        assert!(matches!(
            w.write_diff(&DiffRecord::discard(0, 1), &[]),
            Err(DiffError::ProtocolState(_))
        ));
    }

    #[test]
    fn writer_rejects_unsorted_records() {
        let mut w = SortedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        w.write_diff(&DiffRecord::discard(10, 4), &[]).unwrap();
        assert!(matches!(
            w.write_diff(&DiffRecord::discard(12, 1), &[]),
            Err(DiffError::Sequence(_))
        ));
    }

    #[test]
    fn reader_header_twice_and_wrong_type() {
        let buf = write_sample(PackLimits::default());
        let mut r = SortedDiffReader::new(Cursor::new(&buf));
        r.read_header().unwrap();
        assert!(matches!(r.read_header(), Err(DiffError::ProtocolState(_))));

        let mut h = DiffFileHeader::default();
        h.file_type = DiffFileType::Indexed;
        let mut r = SortedDiffReader::new(Cursor::new(h.encode().to_vec()));
        assert!(matches!(r.read_header(), Err(DiffError::Format(_))));
    }

    #[test]
    fn missing_end_pack_is_truncation() {
        let buf = write_sample(PackLimits::default());
        let cut = &buf[..buf.len() - PACK_HEADER_SIZE];
        let mut r = SortedDiffReader::new(Cursor::new(cut));
        r.read_header().unwrap();
        for _ in 0..4 {
            r.read_diff().unwrap().unwrap();
        }
        assert!(matches!(r.read_diff(), Err(DiffError::Truncated(_))));
    }

    #[test]
    fn short_payload_is_truncation() {
        let buf = write_sample(PackLimits::default());
        let cut = &buf[..FILE_HEADER_SIZE + PACK_HEADER_SIZE + 100];
        let mut r = SortedDiffReader::new(Cursor::new(cut));
        r.read_header().unwrap();
        assert!(matches!(r.read_diff(), Err(DiffError::Truncated(_))));
    }

    #[test]
    fn corrupt_payload_is_checksum_error() {
        let mut buf = write_sample(PackLimits::default());
        buf[FILE_HEADER_SIZE + PACK_HEADER_SIZE + 5] ^= 0xff;
        let mut r = SortedDiffReader::new(Cursor::new(&buf));
        r.read_header().unwrap();
        assert!(matches!(r.read_diff(), Err(DiffError::Checksum { .. })));
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn compressed_roundtrip() {
        let data = vec![0x11u8; 8 * LOGICAL_BLOCK_SIZE];
        let rec = DiffRecord::normal(64, 8, &data);
        let mut w = SortedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        let opts = CompressOptions {
            kind: CompressionType::Snappy,
            level: 0,
        };
        w.compress_and_write_diff(&rec, &data, opts).unwrap();
        w.compress_and_write_diff(&DiffRecord::discard(72, 1), &[], opts)
            .unwrap();
        let buf = w.finish().unwrap();

        let mut r = SortedDiffReader::new(Cursor::new(&buf));
        r.read_header().unwrap();
        let (urec, raw) = r.read_and_uncompress_diff(true).unwrap().unwrap();
        assert_eq!(urec, rec);
        assert_eq!(raw, data);
        let (drec, _) = r.read_and_uncompress_diff(true).unwrap().unwrap();
        assert!(drec.is_discard());
        assert!(r.read_and_uncompress_diff(true).unwrap().is_none());
        assert!(r.stat().data_size < data.len() as u64);
    }

    #[test]
    fn stats_on_both_sides() {
        let mut w = SortedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        w.write_diff(&DiffRecord::all_zero(0, 3), &[]).unwrap();
        w.close().unwrap();
        assert_eq!(w.stat().all_zero_lb, 3);
        let buf = w.finish().unwrap();
        let mut r = SortedDiffReader::new(Cursor::new(&buf));
        r.read_header().unwrap();
        while r.read_diff().unwrap().is_some() {}
        assert_eq!(r.stat().all_zero_nr, 1);
        assert_eq!(r.stat().wdiff_nr, 1);
    }

    #[test]
    fn padding_is_skipped_by_reader() {
        let mut w = SortedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        w.write_diff(&DiffRecord::padding(0), &[]).unwrap();
        w.write_diff(&DiffRecord::discard(0, 1), &[]).unwrap();
        let buf = w.finish().unwrap();
        let recs = read_all(&buf);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].0.is_discard());
    }
}
