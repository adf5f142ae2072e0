// Diff storage: record model, sorted and indexed file formats, overlap
// resolution, the payload cache, merging and the virtual full image.

pub mod cache;
pub mod config;
pub mod header;
pub mod index_mem;
pub mod indexed;
pub mod indexed_record;
pub mod memory;
pub mod merge;
pub mod overlap;
pub mod pack;
pub mod record;
pub mod sorted;
pub mod stat;
pub mod virt;

pub use cache::{CacheKey, IndexedDiffCache};
pub use config::{CompressOptions, LOGICAL_BLOCK_SIZE, PackLimits};
pub use header::{DiffFileHeader, DiffFileType, DiffIndexSuper};
pub use index_mem::DiffIndexMem;
pub use indexed::{IndexedDiffReader, IndexedDiffWriter};
pub use indexed_record::IndexedDiffRecord;
pub use memory::{DiffMemory, DiffRecIo};
pub use merge::{DiffMerger, DiffSource, IndexedDiffStream, SortedDiffStream, open_diff_source};
pub use overlap::Extent;
pub use pack::{DiffPackHeader, DiffPacker};
pub use record::{DiffRecord, RecordFlags, RecordKind};
pub use sorted::{SortedDiffReader, SortedDiffWriter};
pub use stat::DiffStatistics;
pub use virt::{BaseReader, Seekable, Sequential, VirtualFullScanner, open_base};
