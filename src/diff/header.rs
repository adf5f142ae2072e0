// Diff file header and indexed-format super block.
//
// Both are self-verifying: the checksum field is zeroed, the walb checksum
// of the whole struct is stored into it, and a reader accepts the struct
// only if summing all of it (checksum included) gives zero.
//
// DiffFileHeader (32 bytes):
//
//   0  checksum       u32
//   4  version        u32   DIFF_VERSION
//   8  type           u8    1 = sorted, 2 = indexed
//   9  reserved       u8
//  10  reserved       u16
//  12  max_io_blocks  u32   largest io_blocks of any record, 0 if unknown
//  16  uuid           [u8; 16]
//
// DiffIndexSuper (32 bytes, last bytes of an indexed file):
//
//   0  index_offset   u64
//   8  n_records      u64
//  16  n_data         u64   stored payload bytes
//  24  checksum       u32
//  28  reserved       u32

use std::fmt;
use std::io::{Read, Write};

use uuid::Uuid;

use crate::checksum::{is_sealed, seal};
use crate::diff::config::DIFF_VERSION;
use crate::diff::record::{le_u32, le_u64};
use crate::error::{DiffError, Result, read_full};

pub const FILE_HEADER_SIZE: usize = 32;
pub const INDEX_SUPER_SIZE: usize = 32;

const HEADER_CHECKSUM_OFFSET: usize = 0;
const SUPER_CHECKSUM_OFFSET: usize = 24;

/// Diff file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DiffFileType {
    Sorted = 1,
    Indexed = 2,
}

impl DiffFileType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Sorted),
            2 => Some(Self::Indexed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sorted => "sorted",
            Self::Indexed => "indexed",
        }
    }
}

impl fmt::Display for DiffFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DiffFileHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffFileHeader {
    pub version: u32,
    pub file_type: DiffFileType,
    pub max_io_blocks: u32,
    pub uuid: Uuid,
}

impl Default for DiffFileHeader {
    fn default() -> Self {
        Self {
            version: DIFF_VERSION,
            file_type: DiffFileType::Sorted,
            max_io_blocks: 0,
            uuid: Uuid::nil(),
        }
    }
}

impl DiffFileHeader {
    pub fn new(file_type: DiffFileType, uuid: Uuid) -> Self {
        Self {
            file_type,
            uuid,
            ..Self::default()
        }
    }

    pub fn set_max_io_blocks_if_necessary(&mut self, io_blocks: u32) {
        self.max_io_blocks = self.max_io_blocks.max(io_blocks);
    }

    /// Serialize with a freshly computed checksum.
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut b = [0u8; FILE_HEADER_SIZE];
        b[4..8].copy_from_slice(&self.version.to_le_bytes());
        b[8] = self.file_type as u8;
        b[12..16].copy_from_slice(&self.max_io_blocks.to_le_bytes());
        b[16..32].copy_from_slice(self.uuid.as_bytes());
        seal(&mut b, HEADER_CHECKSUM_OFFSET, 0);
        b
    }

    /// Parse and verify checksum, version and type tag.
    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < FILE_HEADER_SIZE {
            return Err(DiffError::truncated(format!(
                "diff file header needs {FILE_HEADER_SIZE} bytes, got {}",
                b.len()
            )));
        }
        let b = &b[..FILE_HEADER_SIZE];
        if !is_sealed(b, 0) {
            let mut copy = [0u8; FILE_HEADER_SIZE];
            copy.copy_from_slice(b);
            let expected = seal(&mut copy, HEADER_CHECKSUM_OFFSET, 0);
            return Err(DiffError::checksum(
                "diff file header",
                expected,
                le_u32(b, HEADER_CHECKSUM_OFFSET),
            ));
        }
        let version = le_u32(b, 4);
        if version != DIFF_VERSION {
            return Err(DiffError::format(format!(
                "diff file header: version {version}, expected {DIFF_VERSION}"
            )));
        }
        let file_type = DiffFileType::from_u8(b[8])
            .ok_or_else(|| DiffError::format(format!("diff file header: bad type {}", b[8])))?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&b[16..32]);
        Ok(Self {
            version,
            file_type,
            max_io_blocks: le_u32(b, 12),
            uuid: Uuid::from_bytes(uuid),
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut b = [0u8; FILE_HEADER_SIZE];
        read_full(r, &mut b, "diff file header")?;
        Self::decode(&b)
    }
}

impl fmt::Display for DiffFileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wdiff v{} {} uuid {} maxIoBlocks {}",
            self.version, self.file_type, self.uuid, self.max_io_blocks
        )
    }
}

// ---------------------------------------------------------------------------
// DiffIndexSuper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffIndexSuper {
    pub index_offset: u64,
    pub n_records: u64,
    pub n_data: u64,
}

impl DiffIndexSuper {
    pub fn encode(&self) -> [u8; INDEX_SUPER_SIZE] {
        let mut b = [0u8; INDEX_SUPER_SIZE];
        b[0..8].copy_from_slice(&self.index_offset.to_le_bytes());
        b[8..16].copy_from_slice(&self.n_records.to_le_bytes());
        b[16..24].copy_from_slice(&self.n_data.to_le_bytes());
        seal(&mut b, SUPER_CHECKSUM_OFFSET, 0);
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < INDEX_SUPER_SIZE {
            return Err(DiffError::truncated(format!(
                "index super needs {INDEX_SUPER_SIZE} bytes, got {}",
                b.len()
            )));
        }
        let b = &b[..INDEX_SUPER_SIZE];
        if !is_sealed(b, 0) {
            let mut copy = [0u8; INDEX_SUPER_SIZE];
            copy.copy_from_slice(b);
            let expected = seal(&mut copy, SUPER_CHECKSUM_OFFSET, 0);
            return Err(DiffError::checksum(
                "index super",
                expected,
                le_u32(b, SUPER_CHECKSUM_OFFSET),
            ));
        }
        Ok(Self {
            index_offset: le_u64(b, 0),
            n_records: le_u64(b, 8),
            n_data: le_u64(b, 16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_roundtrip_and_self_verification() {
        let mut h = DiffFileHeader::new(DiffFileType::Indexed, Uuid::from_bytes([7u8; 16]));
        h.set_max_io_blocks_if_necessary(64);
        h.set_max_io_blocks_if_necessary(8);
        let b = h.encode();
        assert!(is_sealed(&b, 0));
        assert_eq!(DiffFileHeader::decode(&b).unwrap(), h);
        assert_eq!(h.max_io_blocks, 64);
    }

    #[test]
    fn header_corruption_is_checksum_error() {
        let mut b = DiffFileHeader::default().encode();
        b[20] ^= 0x40;
        assert!(matches!(
            DiffFileHeader::decode(&b),
            Err(DiffError::Checksum { .. })
        ));
    }

    #[test]
    fn header_bad_type_is_format_error() {
        let mut b = DiffFileHeader::default().encode();
        b[8] = 9;
        seal(&mut b, HEADER_CHECKSUM_OFFSET, 0);
        assert!(matches!(
            DiffFileHeader::decode(&b),
            Err(DiffError::Format(_))
        ));
    }

    #[test]
    fn header_short_read_is_truncated() {
        let err = DiffFileHeader::read_from(&mut Cursor::new(vec![0u8; 10])).unwrap_err();
        assert!(matches!(err, DiffError::Truncated(_)));
    }

    #[test]
    fn super_roundtrip() {
        let s = DiffIndexSuper {
            index_offset: 4104,
            n_records: 3,
            n_data: 4072,
        };
        let b = s.encode();
        assert_eq!(DiffIndexSuper::decode(&b).unwrap(), s);
        let mut bad = b;
        bad[0] ^= 1;
        assert!(DiffIndexSuper::decode(&bad).is_err());
    }
}
