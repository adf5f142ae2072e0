// Block storage for IO payloads.
//
// Two containers share the `BlockBuffer` interface:
//   - `VecBlocks`: one private contiguous buffer
//   - `SharedBlocks`: a list of reference-counted `Bytes` blocks, so several
//     records (or a reader and the records it hands out) can point at the
//     same physical block without copying
//
// All blocks in one container have the same size.

use bytes::{Bytes, BytesMut};

use crate::diff::config::LOGICAL_BLOCK_SIZE;
use crate::error::{DiffError, Result};

/// A sequence of equally sized blocks.
pub trait BlockBuffer {
    /// Bytes per block.
    fn block_size(&self) -> usize;

    /// Number of blocks held.
    fn block_count(&self) -> usize;

    /// Borrow block `i`. Panics if `i >= block_count()`.
    fn block(&self, i: usize) -> &[u8];

    /// Grow (with zero blocks) or shrink to `n` blocks.
    fn resize(&mut self, n: usize);

    /// Append one block; `data.len()` must equal `block_size()`.
    fn push_block(&mut self, data: &[u8]) -> Result<()>;

    fn total_len(&self) -> usize {
        self.block_size() * self.block_count()
    }

    fn is_empty(&self) -> bool {
        self.block_count() == 0
    }

    /// Append every block to `out`.
    fn copy_to(&self, out: &mut Vec<u8>) {
        out.reserve(self.total_len());
        for i in 0..self.block_count() {
            out.extend_from_slice(self.block(i));
        }
    }

    fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.copy_to(&mut out);
        out
    }
}

fn check_block_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(DiffError::InvalidArgument(format!(
            "block of {got} bytes pushed into a {expected}-byte block buffer"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// VecBlocks
// ---------------------------------------------------------------------------

/// Contiguous block storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VecBlocks {
    block_size: usize,
    data: Vec<u8>,
}

impl VecBlocks {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            data: Vec::new(),
        }
    }

    /// Logical-block sized storage.
    pub fn logical() -> Self {
        Self::new(LOGICAL_BLOCK_SIZE)
    }

    /// Wrap an existing buffer whose length is a multiple of `block_size`.
    pub fn from_vec(block_size: usize, data: Vec<u8>) -> Result<Self> {
        if block_size == 0 || data.len() % block_size != 0 {
            return Err(DiffError::InvalidArgument(format!(
                "{} bytes is not a whole number of {block_size}-byte blocks",
                data.len()
            )));
        }
        Ok(Self { block_size, data })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl BlockBuffer for VecBlocks {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.data.len() / self.block_size
    }

    fn block(&self, i: usize) -> &[u8] {
        let off = i * self.block_size;
        &self.data[off..off + self.block_size]
    }

    fn resize(&mut self, n: usize) {
        self.data.resize(n * self.block_size, 0);
    }

    fn push_block(&mut self, data: &[u8]) -> Result<()> {
        check_block_len(self.block_size, data.len())?;
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn copy_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.data);
    }
}

// ---------------------------------------------------------------------------
// SharedBlocks
// ---------------------------------------------------------------------------

/// Block list of shared handles. Cloning the container clones handles only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedBlocks {
    block_size: usize,
    blocks: Vec<Bytes>,
}

impl SharedBlocks {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: Vec::new(),
        }
    }

    pub fn logical() -> Self {
        Self::new(LOGICAL_BLOCK_SIZE)
    }

    /// Split a shared buffer into block handles without copying.
    pub fn from_bytes(block_size: usize, data: Bytes) -> Result<Self> {
        if block_size == 0 || data.len() % block_size != 0 {
            return Err(DiffError::InvalidArgument(format!(
                "{} bytes is not a whole number of {block_size}-byte blocks",
                data.len()
            )));
        }
        let blocks = (0..data.len() / block_size)
            .map(|i| data.slice(i * block_size..(i + 1) * block_size))
            .collect();
        Ok(Self { block_size, blocks })
    }

    /// Append a block handle without copying.
    pub fn push_shared(&mut self, block: Bytes) -> Result<()> {
        check_block_len(self.block_size, block.len())?;
        self.blocks.push(block);
        Ok(())
    }

    /// Shared handle to block `i`.
    pub fn shared_block(&self, i: usize) -> Bytes {
        self.blocks[i].clone()
    }
}

impl BlockBuffer for SharedBlocks {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block(&self, i: usize) -> &[u8] {
        &self.blocks[i]
    }

    fn resize(&mut self, n: usize) {
        if n <= self.blocks.len() {
            self.blocks.truncate(n);
            return;
        }
        let zero = BytesMut::zeroed(self.block_size).freeze();
        self.blocks.resize(n, zero);
    }

    fn push_block(&mut self, data: &[u8]) -> Result<()> {
        self.push_shared(Bytes::copy_from_slice(data))
    }
}
