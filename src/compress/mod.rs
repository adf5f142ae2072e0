// Payload compression for diff IOs.
//
// - `types`   : CompressionType tag stored in every diff record
// - `backend` : Pluggable `CompressBackend` trait plus the built-in codecs
//               (zlib via flate2, snappy via snap, xz via lzma-rs)
//
// The codecs themselves are black boxes: the diff engine only relies on
// `compress_data(type, level, data)` and `uncompress_data(type, data, len)`.

pub mod backend;
pub mod types;

pub use backend::{CompressBackend, backend_for, compress_data, uncompress_data};
pub use types::CompressionType;
