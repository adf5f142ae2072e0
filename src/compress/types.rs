// Compression type tag carried by diff records.

use std::fmt;
use std::str::FromStr;

use crate::error::DiffError;

/// How a diff IO payload is stored on disk.
///
/// The discriminants are the on-disk byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
    Lzma = 3,
}

impl CompressionType {
    pub const ALL: [CompressionType; 4] = [Self::None, Self::Gzip, Self::Snappy, Self::Lzma];

    /// Decode the on-disk tag.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Snappy),
            3 => Some(Self::Lzma),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lzma => "lzma",
        }
    }

    pub fn is_compressed(self) -> bool {
        self != Self::None
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionType {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DiffError::InvalidArgument(format!("unknown compression type: {s}")))
    }
}
