// Error type shared by every diff codec, the cache, the merger and the
// virtual full scanner.
//
// End of stream is never an error: readers return `Ok(None)` / `Ok(0)`.
// Running out of input where more bytes were required is `Truncated`.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiffError>;

#[derive(Debug, Error)]
pub enum DiffError {
    /// Underlying read/write/seek failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bad version, type tag, layout, or a payload that fails to
    /// compress/decompress.
    #[error("format error: {0}")]
    Format(String),

    /// Stored and computed checksums disagree.
    #[error("checksum mismatch in {what}: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    /// Addresses or offsets out of order, or an index invariant broken.
    #[error("sequence error: {0}")]
    Sequence(String),

    /// The indexed reader needs random access.
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    /// Call made in the wrong state (header twice, write before header,
    /// write after close).
    #[error("protocol state error: {0}")]
    ProtocolState(&'static str),

    /// Input ended where more data was required.
    #[error("truncated input: {0}")]
    Truncated(String),

    /// A caller-supplied argument violates the documented contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DiffError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub(crate) fn sequence(msg: impl Into<String>) -> Self {
        Self::Sequence(msg.into())
    }

    pub(crate) fn truncated(msg: impl Into<String>) -> Self {
        Self::Truncated(msg.into())
    }

    pub(crate) fn checksum(what: &'static str, expected: u32, actual: u32) -> Self {
        Self::Checksum {
            what,
            expected,
            actual,
        }
    }
}

/// Fill `buf` completely, or report how far we got.
///
/// Returns `Ok(false)` when the source is already at EOF (zero bytes read)
/// and `Truncated` when it ends part way through `buf`.
pub(crate) fn read_full_or_eof<R: io::Read>(
    r: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if filled == 0 && !buf.is_empty() {
        return Ok(false);
    }
    if filled < buf.len() {
        return Err(DiffError::truncated(format!(
            "{what}: got {filled} of {} bytes",
            buf.len()
        )));
    }
    Ok(true)
}

/// Fill `buf` completely; any shortfall is `Truncated`.
pub(crate) fn read_full<R: io::Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    if read_full_or_eof(r, buf, what)? {
        Ok(())
    } else {
        Err(DiffError::truncated(format!(
            "{what}: end of input, expected {} bytes",
            buf.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_full_or_eof_distinguishes_clean_end() {
        let mut buf = [0u8; 4];
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(!read_full_or_eof(&mut empty, &mut buf, "x").unwrap());

        let mut short = Cursor::new(vec![1u8, 2]);
        let err = read_full_or_eof(&mut short, &mut buf, "x").unwrap_err();
        assert!(matches!(err, DiffError::Truncated(_)));

        let mut exact = Cursor::new(vec![1u8, 2, 3, 4]);
        assert!(read_full_or_eof(&mut exact, &mut buf, "x").unwrap());
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn read_full_rejects_eof() {
        let mut buf = [0u8; 2];
        let err = read_full(&mut Cursor::new(Vec::<u8>::new()), &mut buf, "hdr").unwrap_err();
        assert!(err.to_string().contains("hdr"));
    }

    #[test]
    fn checksum_display_is_hex() {
        let e = DiffError::checksum("pack header", 1, 0xdead_beef);
        assert_eq!(
            e.to_string(),
            "checksum mismatch in pack header: expected 0x00000001, got 0xdeadbeef"
        );
    }
}
