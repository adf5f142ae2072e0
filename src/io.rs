// File-level helpers over the diff engine.
//
// `merge_files()`, `virtual_full_to_file()`, `index_file()` and `show_file()`
// wrap the streaming types with buffered file I/O. The virtual full helpers
// optionally compute a streaming SHA-256 of the image (feature `file-io`).

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

#[cfg(feature = "file-io")]
use sha2::Digest;

use crate::diff::cache::IndexedDiffCache;
use crate::diff::config::{CompressOptions, DEFAULT_CACHE_BYTES, DEFAULT_MAX_IO_BLOCKS};
use crate::diff::header::{DiffFileHeader, DiffFileType};
use crate::diff::indexed::{IndexedDiffReader, IndexedDiffWriter};
use crate::diff::indexed_record::IndexedDiffRecord;
use crate::diff::merge::{DiffMerger, open_diff_source};
use crate::diff::record::RecordKind;
use crate::diff::sorted::SortedDiffReader;
use crate::diff::stat::DiffStatistics;
use crate::diff::virt::{BaseReader, VirtualFullScanner, open_base};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Options and stats
// ---------------------------------------------------------------------------

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

/// Knobs for `merge_files()`.
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub compress: CompressOptions,
    /// 0 takes the largest cap among the inputs.
    pub max_io_blocks: u32,
    pub validate_uuid: bool,
    pub cache_bytes: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            compress: CompressOptions::default(),
            max_io_blocks: 0,
            validate_uuid: false,
            cache_bytes: DEFAULT_CACHE_BYTES,
        }
    }
}

/// Returned by `merge_files()`.
#[derive(Debug, Clone)]
pub struct MergeStats {
    pub inputs: usize,
    pub output_size: u64,
    pub header: DiffFileHeader,
    pub stat_in: DiffStatistics,
    pub stat_out: DiffStatistics,
}

/// Returned by the virtual full helpers.
#[derive(Debug, Clone)]
pub struct FullStats {
    pub output_size: u64,
    pub stat_in: DiffStatistics,
    pub stat_out: DiffStatistics,
    /// SHA-256 of the image (if `file-io` feature is enabled).
    pub output_sha256: Option<[u8; 32]>,
}

/// Returned by `index_file()`.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub n_records: u64,
    pub output_size: u64,
    pub stat: DiffStatistics,
}

// ---------------------------------------------------------------------------
// merge_files
// ---------------------------------------------------------------------------

/// Merge diff files (oldest first, either format) into one sorted diff.
pub fn merge_files<P: AsRef<Path>>(
    inputs: &[P],
    output: &Path,
    opts: &MergeOptions,
) -> Result<MergeStats> {
    let mut merger = DiffMerger::new();
    merger.set_max_io_blocks(opts.max_io_blocks);
    merger.set_should_validate_uuid(opts.validate_uuid);
    merger.set_cache_bytes(opts.cache_bytes);
    for p in inputs {
        merger.add_wdiff_file(p)?;
    }
    let out = BufWriter::with_capacity(BUF_SIZE, File::create(output)?);
    let out = merger.merge_to(out, opts.compress)?;
    let output_size = out.into_inner().map_err(|e| e.into_error())?.metadata()?.len();
    Ok(MergeStats {
        inputs: inputs.len(),
        output_size,
        header: *merger.header(),
        stat_in: *merger.stat_in(),
        stat_out: *merger.stat_out(),
    })
}

// ---------------------------------------------------------------------------
// Virtual full image
// ---------------------------------------------------------------------------

/// Stream `base` overlaid with `diffs` (oldest first) into `out`.
pub fn virtual_full<B, W, P>(
    base: B,
    diffs: &[P],
    out: &mut W,
    buf_size: usize,
    cache_bytes: usize,
) -> Result<FullStats>
where
    B: BaseReader,
    W: Write,
    P: AsRef<Path>,
{
    let mut scanner = if diffs.is_empty() {
        VirtualFullScanner::without_diffs(base)
    } else {
        let mut merger = DiffMerger::new();
        merger.set_cache_bytes(cache_bytes);
        for p in diffs {
            merger.add_wdiff_file(p)?;
        }
        VirtualFullScanner::new(base, merger)?
    };

    #[cfg(feature = "file-io")]
    let mut hasher = sha2::Sha256::new();

    #[cfg(feature = "file-io")]
    let output_size = {
        let mut w = HashingWriter {
            inner: out,
            hasher: &mut hasher,
        };
        scanner.read_and_write_to(&mut w, buf_size)?
    };
    #[cfg(not(feature = "file-io"))]
    let output_size = scanner.read_and_write_to(out, buf_size)?;

    #[cfg(feature = "file-io")]
    let output_sha256 = Some(hasher.finalize().into());
    #[cfg(not(feature = "file-io"))]
    let output_sha256: Option<[u8; 32]> = None;

    Ok(FullStats {
        output_size,
        stat_in: scanner.stat_in(),
        stat_out: *scanner.stat_out(),
        output_sha256,
    })
}

/// Materialize the image of `base` plus `diffs` at `output`.
pub fn virtual_full_to_file<P: AsRef<Path>>(
    base: &Path,
    diffs: &[P],
    output: &Path,
    buf_size: usize,
) -> Result<FullStats> {
    let base = open_base(File::open(base)?);
    let mut out = BufWriter::with_capacity(BUF_SIZE, File::create(output)?);
    let stats = virtual_full(base, diffs, &mut out, buf_size, DEFAULT_CACHE_BYTES)?;
    out.flush()?;
    Ok(stats)
}

// ---------------------------------------------------------------------------
// index_file
// ---------------------------------------------------------------------------

/// Rewrite a diff file of either format as an indexed diff.
pub fn index_file(
    input: &Path,
    output: &Path,
    opts: CompressOptions,
    max_io_blocks: u32,
) -> Result<IndexStats> {
    let mut src = open_diff_source(input)?;
    let mut cache = IndexedDiffCache::default();
    let out = BufWriter::with_capacity(BUF_SIZE, File::create(output)?);
    let cap = if max_io_blocks == 0 {
        DEFAULT_MAX_IO_BLOCKS
    } else {
        max_io_blocks
    };
    let mut writer = IndexedDiffWriter::with_max_io_blocks(out, cap);
    let mut header = DiffFileHeader::new(DiffFileType::Indexed, src.header().uuid);
    header.set_max_io_blocks_if_necessary(src.header().max_io_blocks);
    writer.write_header(&mut header)?;

    while let Some(r) = src.next_rec_io(&mut cache)? {
        let rec = r.record();
        match rec.kind() {
            RecordKind::Normal => {
                let irec = IndexedDiffRecord::normal(rec.io_address, rec.io_blocks, r.io());
                writer.compress_and_write_diff(&irec, r.io(), opts)?;
            }
            RecordKind::AllZero => {
                writer.write_diff(&IndexedDiffRecord::all_zero(rec.io_address, rec.io_blocks), &[])?;
            }
            RecordKind::Discard => {
                writer.write_diff(&IndexedDiffRecord::discard(rec.io_address, rec.io_blocks), &[])?;
            }
            RecordKind::Padding => {}
        }
    }
    let stat = writer.stat();
    let n_records = writer.index().len() as u64;
    let out = writer.finish()?;
    let output_size = out.into_inner().map_err(|e| e.into_error())?.metadata()?.len();
    Ok(IndexStats {
        n_records,
        output_size,
        stat,
    })
}

// ---------------------------------------------------------------------------
// show_file
// ---------------------------------------------------------------------------

/// Print the header and one line per record of a diff file.
pub fn show_file<W: Write>(path: &Path, out: &mut W) -> Result<(DiffFileHeader, DiffStatistics)> {
    let mut r = BufReader::new(File::open(path)?);
    let header = DiffFileHeader::read_from(&mut r)?;
    writeln!(out, "{header}")?;
    let stat = match header.file_type {
        DiffFileType::Sorted => {
            let mut reader = SortedDiffReader::with_header(r, header)?;
            while let Some((rec, _)) = reader.read_diff()? {
                writeln!(out, "{rec}")?;
            }
            *reader.stat()
        }
        DiffFileType::Indexed => {
            drop(r);
            let mut reader = IndexedDiffReader::open(path)?;
            while let Some(rec) = reader.read_diff_record()? {
                writeln!(out, "{rec}")?;
            }
            *reader.stat()
        }
    };
    Ok((header, stat))
}

// ---------------------------------------------------------------------------
// Hashing writer (used with file-io feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "file-io")]
struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: &'a mut sha2::Sha256,
}

#[cfg(feature = "file-io")]
impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::config::blocks_to_bytes;
    use crate::diff::record::DiffRecord;
    use crate::diff::sorted::SortedDiffWriter;
    use std::path::PathBuf;

    fn write_sorted(dir: &Path, name: &str, ios: &[(u64, u32, u8)]) -> PathBuf {
        let path = dir.join(name);
        let mut w = SortedDiffWriter::new(BufWriter::new(File::create(&path).unwrap()));
        let mut h = DiffFileHeader::default();
        w.write_header(&mut h).unwrap();
        for &(addr, blocks, fill) in ios {
            let data = vec![fill; blocks_to_bytes(blocks)];
            w.compress_and_write_diff(
                &DiffRecord::normal(addr, blocks, &data),
                &data,
                CompressOptions::default(),
            )
            .unwrap();
        }
        w.finish().unwrap().flush().unwrap();
        path
    }

    #[test]
    fn merge_then_full_matches_direct_full() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_sorted(dir.path(), "a.wdiff", &[(0, 4, 1), (8, 2, 2)]);
        let b = write_sorted(dir.path(), "b.wdiff", &[(2, 4, 3)]);
        let base = dir.path().join("base.img");
        std::fs::write(&base, vec![0xEEu8; blocks_to_bytes(12)]).unwrap();

        let merged = dir.path().join("m.wdiff");
        let ms = merge_files(&[&a, &b], &merged, &MergeOptions::default()).unwrap();
        assert_eq!(ms.inputs, 2);
        assert_eq!(ms.stat_out.normal_nr, 3);

        let direct = dir.path().join("direct.img");
        let via = dir.path().join("via.img");
        let s1 = virtual_full_to_file(&base, &[&a, &b], &direct, 4096).unwrap();
        let s2 = virtual_full_to_file(&base, &[&merged], &via, 4096).unwrap();
        assert_eq!(std::fs::read(&direct).unwrap(), std::fs::read(&via).unwrap());
        assert_eq!(s1.output_size, blocks_to_bytes(12) as u64);
        assert_eq!(s1.output_sha256, s2.output_sha256);

        let img = std::fs::read(&direct).unwrap();
        let fill_of = |blk: u32| img[blocks_to_bytes(blk)];
        let got: Vec<u8> = (0..12).map(fill_of).collect();
        assert_eq!(got, vec![1, 1, 3, 3, 3, 3, 0xEE, 0xEE, 2, 2, 0xEE, 0xEE]);
    }

    #[test]
    fn index_file_converts_and_show_lists_records() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_sorted(dir.path(), "a.wdiff", &[(0, 2, 5), (4, 1, 6)]);
        let idx = dir.path().join("a.idx");
        let st = index_file(&a, &idx, CompressOptions::default(), 0).unwrap();
        assert_eq!(st.n_records, 2);
        assert_eq!(st.stat.normal_lb, 3);

        let mut text = Vec::new();
        let (h, stat) = show_file(&idx, &mut text).unwrap();
        assert_eq!(h.file_type, DiffFileType::Indexed);
        assert_eq!(stat.normal_nr, 2);
        assert_eq!(String::from_utf8(text).unwrap().lines().count(), 3);

        let mut text = Vec::new();
        let (h, _) = show_file(&a, &mut text).unwrap();
        assert_eq!(h.file_type, DiffFileType::Sorted);
        assert_eq!(String::from_utf8(text).unwrap().lines().count(), 3);
    }

    #[cfg(feature = "file-io")]
    #[test]
    fn sha256_matches_image() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.img");
        let data = vec![7u8; blocks_to_bytes(4)];
        std::fs::write(&base, &data).unwrap();
        let out = dir.path().join("out.img");
        let none: [&Path; 0] = [];
        let st = virtual_full_to_file(&base, &none, &out, 1024).unwrap();
        let want: [u8; 32] = sha2::Sha256::digest(&data).into();
        assert_eq!(st.output_sha256, Some(want));
    }
}
