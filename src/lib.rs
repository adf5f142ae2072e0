//! wdiff: block-device diff storage for continuous replication.
//!
//! The crate provides:
//! - Sorted (streaming) and indexed (random access) diff file formats
//!   (`diff::sorted`, `diff::indexed`)
//! - Overlap resolution that keeps IO ranges disjoint, newest write wins
//! - A byte-bounded LRU cache of decompressed payloads (`diff::cache`)
//! - K-way merging of diff chains (`diff::merge`)
//! - A streaming virtual full image: base image plus diffs (`diff::virt`)
//! - Pluggable payload compression (`compress`)
//! - File-oriented helpers (`io`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use std::io::Cursor;
//! use wdiff::diff::{DiffFileHeader, DiffRecord, SortedDiffReader, SortedDiffWriter};
//!
//! let data = vec![0xAB; 1024];
//! let mut writer = SortedDiffWriter::new(Vec::new());
//! writer.write_header(&mut DiffFileHeader::default()).unwrap();
//! writer.write_diff(&DiffRecord::normal(8, 2, &data), &data).unwrap();
//! let buf = writer.finish().unwrap();
//!
//! let mut reader = SortedDiffReader::new(Cursor::new(buf));
//! reader.read_header().unwrap();
//! let (rec, io) = reader.read_diff().unwrap().unwrap();
//! assert_eq!((rec.io_address, rec.io_blocks), (8, 2));
//! assert_eq!(io, data);
//! ```

pub mod block;
pub mod checksum;
pub mod compress;
pub mod diff;
pub mod error;
pub mod io;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{DiffError, Result};
