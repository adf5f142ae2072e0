// Compression backends for diff IO payloads.
//
// Provides a pluggable `CompressBackend` trait with built-in implementations:
//   - Zlib/Deflate (via flate2, feature-gated `gzip`), tag Gzip
//   - Snappy raw format (via snap, feature-gated `snappy`), tag Snappy
//   - XZ/LZMA2 (via lzma-rs, feature-gated `lzma`), tag Lzma
//   - AsIs (passthrough), tag None
//
// Decompression always knows the expected uncompressed length (the record's
// block count), so every backend output is length-checked by the caller.

use std::io;

use super::types::CompressionType;
use crate::error::{DiffError, Result};

/// Payloads shorter than this are never worth compressing.
const MIN_COMPRESS_SIZE: usize = 64;

/// Most a decoder reserves up front; output beyond this grows on demand.
const MAX_PREALLOC: usize = 1 << 20;

// ---------------------------------------------------------------------------
// CompressBackend trait
// ---------------------------------------------------------------------------

/// A payload compressor bound to one `CompressionType` tag.
pub trait CompressBackend: Send + Sync {
    /// Tag stored in records compressed by this backend.
    fn kind(&self) -> CompressionType;

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Decompress a payload. `size_hint` is the expected output length;
    /// decoders stop one byte past it so oversized streams fail the length
    /// check instead of growing without bound.
    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>>;

    fn should_compress(&self, data: &[u8]) -> bool {
        data.len() >= MIN_COMPRESS_SIZE
    }
}

// ---------------------------------------------------------------------------
// Zlib backend
// ---------------------------------------------------------------------------

/// Zlib stream (deflate plus zlib header and adler32 trailer).
#[cfg(feature = "gzip")]
#[derive(Debug, Clone, Copy)]
pub struct ZlibBackend {
    level: flate2::Compression,
}

#[cfg(feature = "gzip")]
impl ZlibBackend {
    /// Create a Zlib backend with the given compression level (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level.min(9)),
        }
    }
}

#[cfg(feature = "gzip")]
impl Default for ZlibBackend {
    fn default() -> Self {
        Self::new(6)
    }
}

#[cfg(feature = "gzip")]
impl CompressBackend for ZlibBackend {
    fn kind(&self) -> CompressionType {
        CompressionType::Gzip
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        use flate2::write::ZlibEncoder;
        use io::Write;

        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        use flate2::read::ZlibDecoder;
        use io::Read;

        let mut decoder = ZlibDecoder::new(data).take(size_hint as u64 + 1);
        let mut output = Vec::with_capacity(size_hint.min(MAX_PREALLOC));
        decoder
            .read_to_end(&mut output)
            .map_err(|e| DiffError::format(format!("zlib decompression failed: {e}")))?;
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Snappy backend
// ---------------------------------------------------------------------------

/// Snappy raw block format (no framing).
#[cfg(feature = "snappy")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SnappyBackend;

#[cfg(feature = "snappy")]
impl CompressBackend for SnappyBackend {
    fn kind(&self) -> CompressionType {
        CompressionType::Snappy
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(io::Error::other)
    }

    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        let len = snap::raw::decompress_len(data)
            .map_err(|e| DiffError::format(format!("snappy decompression failed: {e}")))?;
        if len != size_hint {
            return Err(DiffError::format(format!(
                "snappy payload claims {len} bytes, expected {size_hint}"
            )));
        }
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| DiffError::format(format!("snappy decompression failed: {e}")))
    }
}

// ---------------------------------------------------------------------------
// LZMA backend
// ---------------------------------------------------------------------------

/// XZ container around LZMA2. lzma-rs has no tunable level.
#[cfg(feature = "lzma")]
#[derive(Debug, Clone, Copy, Default)]
pub struct XzBackend;

#[cfg(feature = "lzma")]
impl CompressBackend for XzBackend {
    fn kind(&self) -> CompressionType {
        CompressionType::Lzma
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut input = io::Cursor::new(data);
        let mut output = Vec::new();
        lzma_rs::xz_compress(&mut input, &mut output)?;
        Ok(output)
    }

    fn decompress(&self, data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        let mut input = io::BufReader::new(io::Cursor::new(data));
        let mut output = BoundedSink {
            buf: Vec::with_capacity(size_hint.min(MAX_PREALLOC)),
            limit: size_hint,
        };
        lzma_rs::xz_decompress(&mut input, &mut output)
            .map_err(|e| DiffError::format(format!("xz decompression failed: {e}")))?;
        Ok(output.buf)
    }
}

/// Collects decoder output, failing once it passes `limit` bytes.
#[cfg(feature = "lzma")]
struct BoundedSink {
    buf: Vec<u8>,
    limit: usize,
}

#[cfg(feature = "lzma")]
impl io::Write for BoundedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            return Err(io::Error::other(format!(
                "output exceeds the expected {} bytes",
                self.limit
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Passthrough
// ---------------------------------------------------------------------------

/// Stores payloads unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsIs;

impl CompressBackend for AsIs {
    fn kind(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _size_hint: usize) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn should_compress(&self, _data: &[u8]) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Backend for a compression tag. `level` only affects zlib.
pub fn backend_for(kind: CompressionType, level: u32) -> Result<Box<dyn CompressBackend>> {
    match kind {
        CompressionType::None => Ok(Box::new(AsIs)),

        #[cfg(feature = "gzip")]
        CompressionType::Gzip => Ok(Box::new(ZlibBackend::new(level))),

        #[cfg(feature = "snappy")]
        CompressionType::Snappy => {
            let _ = level;
            Ok(Box::new(SnappyBackend))
        }

        #[cfg(feature = "lzma")]
        CompressionType::Lzma => Ok(Box::new(XzBackend)),

        #[allow(unreachable_patterns)]
        other => {
            let _ = level;
            Err(DiffError::format(format!(
                "compression type '{other}' is not enabled in this build"
            )))
        }
    }
}

/// Compress `data` with `kind`.
///
/// Returns the tag actually used and the stored bytes: when compression does
/// not shrink the payload the data is kept as-is under `CompressionType::None`.
pub fn compress_data(
    kind: CompressionType,
    level: u32,
    data: &[u8],
) -> Result<(CompressionType, Vec<u8>)> {
    let backend = backend_for(kind, level)?;
    if !backend.should_compress(data) {
        return Ok((CompressionType::None, data.to_vec()));
    }
    let compressed = backend
        .compress(data)
        .map_err(|e| DiffError::format(format!("{kind} compression failed: {e}")))?;
    if compressed.len() < data.len() {
        Ok((kind, compressed))
    } else {
        Ok((CompressionType::None, data.to_vec()))
    }
}

/// Decompress `data` stored as `kind`; the result must be exactly
/// `expected_len` bytes.
pub fn uncompress_data(kind: CompressionType, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let out = backend_for(kind, 0)?.decompress(data, expected_len)?;
    if out.len() != expected_len {
        return Err(DiffError::format(format!(
            "{kind} payload decompressed to {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        b"block device replication payload "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn every_enabled_backend_roundtrips() {
        let data = sample(4096);
        for kind in CompressionType::ALL {
            let Ok(backend) = backend_for(kind, 6) else {
                continue;
            };
            let stored = backend.compress(&data).unwrap();
            let back = backend.decompress(&stored, data.len()).unwrap();
            assert_eq!(back, data, "{kind}");
        }
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn compress_data_shrinks_redundant_payload() {
        let data = sample(8192);
        let (kind, stored) = compress_data(CompressionType::Snappy, 0, &data).unwrap();
        assert_eq!(kind, CompressionType::Snappy);
        assert!(stored.len() < data.len());
        assert_eq!(uncompress_data(kind, &stored, data.len()).unwrap(), data);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn incompressible_payload_is_kept_raw() {
        let mut s = 0x1234_5678u64;
        let data: Vec<u8> = (0..1024)
            .map(|_| {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
                (s >> 33) as u8
            })
            .collect();
        let (kind, stored) = compress_data(CompressionType::Gzip, 9, &data).unwrap();
        assert_eq!(kind, CompressionType::None);
        assert_eq!(stored, data);
    }

    #[test]
    fn tiny_payload_is_never_compressed() {
        let (kind, stored) = compress_data(CompressionType::None, 0, b"abc").unwrap();
        assert_eq!(kind, CompressionType::None);
        assert_eq!(stored, b"abc");
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn length_mismatch_is_format_error() {
        let data = sample(2048);
        let (kind, stored) = compress_data(CompressionType::Gzip, 6, &data).unwrap();
        let err = uncompress_data(kind, &stored, 1024).unwrap_err();
        assert!(matches!(err, DiffError::Format(_)));
    }

    #[test]
    fn decoders_stop_past_the_expected_length() {
        let data = sample(64 * 1024);
        for kind in CompressionType::ALL {
            let Ok(backend) = backend_for(kind, 6) else {
                continue;
            };
            if kind == CompressionType::None {
                continue;
            }
            let stored = backend.compress(&data).unwrap();
            match backend.decompress(&stored, 512) {
                Ok(out) => assert!(out.len() <= 513, "{kind}: {} bytes", out.len()),
                Err(e) => assert!(matches!(e, DiffError::Format(_)), "{kind}: {e}"),
            }
            assert!(uncompress_data(kind, &stored, 512).is_err(), "{kind}");
        }
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn garbage_input_is_format_error() {
        let err = uncompress_data(CompressionType::Gzip, b"not zlib at all", 512).unwrap_err();
        assert!(matches!(err, DiffError::Format(_)));
    }
}
