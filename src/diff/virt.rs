// Virtual full image: a base image overlaid with a merged diff chain,
// streamed front to back without materializing anything.
//
// The cursor advances in logical blocks. At each step the bytes come either
// from the pending diff IO (when it starts at the cursor) or from the base,
// up to the next diff boundary. Diff IOs consume the base in lock-step so
// both stay aligned.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

use log::debug;

use crate::diff::config::LOGICAL_BLOCK_SIZE;
use crate::diff::memory::DiffRecIo;
use crate::diff::merge::DiffMerger;
use crate::diff::stat::DiffStatistics;
use crate::error::{DiffError, Result};

// ---------------------------------------------------------------------------
// Base readers
// ---------------------------------------------------------------------------

/// Base image source: a reader that can also skip ahead.
pub trait BaseReader: Read {
    /// Move `len` bytes forward. Skipping past the end is not an error.
    fn skip(&mut self, len: u64) -> Result<()>;
}

impl<B: BaseReader + ?Sized> BaseReader for Box<B> {
    fn skip(&mut self, len: u64) -> Result<()> {
        (**self).skip(len)
    }
}

/// Skips by seeking.
pub struct Seekable<R>(pub R);

impl<R: Read> Read for Seekable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Seek> BaseReader for Seekable<R> {
    fn skip(&mut self, len: u64) -> Result<()> {
        let off = i64::try_from(len)
            .map_err(|_| DiffError::InvalidArgument(format!("skip of {len} bytes")))?;
        self.0.seek(SeekFrom::Current(off))?;
        Ok(())
    }
}

/// Skips by reading and discarding (pipes, stdin).
pub struct Sequential<R>(pub R);

impl<R: Read> Read for Sequential<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read> BaseReader for Sequential<R> {
    fn skip(&mut self, len: u64) -> Result<()> {
        io::copy(&mut (&mut self.0).take(len), &mut io::sink())?;
        Ok(())
    }
}

/// Wrap `file` in the right reader for whether it can seek.
pub fn open_base(mut file: File) -> Box<dyn BaseReader> {
    if file.stream_position().is_ok() {
        Box::new(Seekable(BufReader::new(file)))
    } else {
        Box::new(Sequential(BufReader::new(file)))
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct VirtualFullScanner<B: BaseReader> {
    base: B,
    merger: Option<DiffMerger>,
    /// Cursor in logical blocks.
    addr: u64,
    cur: Option<DiffRecIo>,
    /// Blocks of `cur` already served.
    off_in_io: u32,
    end_of_diff: bool,
    stat_out: DiffStatistics,
}

impl<B: BaseReader> VirtualFullScanner<B> {
    /// Overlay the diffs queued in `merger` (oldest first) on `base`.
    pub fn new(base: B, mut merger: DiffMerger) -> Result<Self> {
        merger.prepare()?;
        Ok(Self {
            base,
            merger: Some(merger),
            addr: 0,
            cur: None,
            off_in_io: 0,
            end_of_diff: false,
            stat_out: DiffStatistics::default(),
        })
    }

    /// Pass the base through unchanged.
    pub fn without_diffs(base: B) -> Self {
        Self {
            base,
            merger: None,
            addr: 0,
            cur: None,
            off_in_io: 0,
            end_of_diff: true,
            stat_out: DiffStatistics::default(),
        }
    }

    /// Input counters of the diff chain consumed so far.
    pub fn stat_in(&self) -> DiffStatistics {
        self.merger
            .as_ref()
            .map(|m| *m.stat_in())
            .unwrap_or_default()
    }

    /// Counters of the diff IOs served.
    pub fn stat_out(&self) -> &DiffStatistics {
        &self.stat_out
    }

    /// Cursor position in logical blocks.
    pub fn address(&self) -> u64 {
        self.addr
    }

    /// Fill a prefix of `buf`; returns the byte count, 0 at the end.
    /// `buf.len()` must be a multiple of the logical block size.
    pub fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() % LOGICAL_BLOCK_SIZE != 0 {
            return Err(DiffError::InvalidArgument(format!(
                "read size {} is not a multiple of {LOGICAL_BLOCK_SIZE}",
                buf.len()
            )));
        }
        let blks = u64::try_from(buf.len() / LOGICAL_BLOCK_SIZE)
            .unwrap_or(u64::MAX)
            .min(u64::from(u32::MAX));
        if blks == 0 {
            return Ok(0);
        }
        self.fill_diff_io()?;
        let Some(cur) = &self.cur else {
            return self.read_base(buf, blks);
        };
        let diff_addr = cur.record().io_address + u64::from(self.off_in_io);
        if diff_addr < self.addr {
            return Err(DiffError::sequence(format!(
                "diff io at {diff_addr} behind cursor {}",
                self.addr
            )));
        }
        if diff_addr == self.addr {
            let remaining = u64::from(cur.record().io_blocks - self.off_in_io);
            return self.read_wdiff(buf, blks.min(remaining));
        }
        self.read_base(buf, blks.min(diff_addr - self.addr))
    }

    /// Fill `buf` completely.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_some(&mut buf[done..])?;
            if n == 0 {
                return Err(DiffError::truncated(format!(
                    "virtual full image ended after {done} of {} bytes",
                    buf.len()
                )));
            }
            done += n;
        }
        Ok(())
    }

    /// Stream the whole image into `w` through a `buf_size` byte buffer.
    /// Returns the number of bytes written.
    pub fn read_and_write_to<W: Write>(&mut self, w: &mut W, buf_size: usize) -> Result<u64> {
        if buf_size == 0 {
            return Err(DiffError::InvalidArgument("zero buffer size".into()));
        }
        let mut buf = vec![0u8; buf_size];
        let mut total = 0u64;
        loop {
            let n = self.read_some(&mut buf)?;
            if n == 0 {
                break;
            }
            w.write_all(&buf[..n])?;
            total += n as u64;
        }
        w.flush()?;
        debug!(
            "virtual full: {total} bytes, {} diff ios applied",
            self.stat_out.total_ios()
        );
        Ok(total)
    }

    fn fill_diff_io(&mut self) -> Result<()> {
        if self.end_of_diff {
            return Ok(());
        }
        if let Some(cur) = &self.cur
            && self.off_in_io < cur.record().io_blocks
        {
            return Ok(());
        }
        self.cur = None;
        self.off_in_io = 0;
        let next = match self.merger.as_mut() {
            Some(m) => m.get_and_remove()?,
            None => None,
        };
        match next {
            Some(r) => {
                self.stat_out.update(r.record());
                self.cur = Some(r);
            }
            None => self.end_of_diff = true,
        }
        Ok(())
    }

    fn read_base(&mut self, buf: &mut [u8], blks: u64) -> Result<usize> {
        let want = blks as usize * LOGICAL_BLOCK_SIZE;
        let mut got = 0;
        while got < want {
            match self.base.read(&mut buf[got..want]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if got % LOGICAL_BLOCK_SIZE != 0 {
            return Err(DiffError::format(format!(
                "base image ends {} bytes into a logical block",
                got % LOGICAL_BLOCK_SIZE
            )));
        }
        self.addr += (got / LOGICAL_BLOCK_SIZE) as u64;
        Ok(got)
    }

    fn read_wdiff(&mut self, buf: &mut [u8], blks: u64) -> Result<usize> {
        let Some(cur) = &self.cur else {
            return Ok(0);
        };
        let len = blks as usize * LOGICAL_BLOCK_SIZE;
        if cur.record().is_normal() {
            let off = self.off_in_io as usize * LOGICAL_BLOCK_SIZE;
            buf[..len].copy_from_slice(&cur.io()[off..off + len]);
        } else {
            buf[..len].fill(0);
        }
        self.off_in_io += blks as u32;
        self.base.skip(len as u64)?;
        self.addr += blks;
        Ok(len)
    }
}
