// Byte-bounded LRU cache of decompressed diff IO payloads.
//
// Keyed by (reader id, data_offset) so one cache can serve several indexed
// readers at once. Entries are `Bytes`: `find` hands out a clone of the
// handle, so a caller's view stays valid even after the entry is evicted.
//
// Recency is kept in an intrusive doubly-linked list stored in a slab
// (`Vec<Node>` plus a free list); lookups go through a `HashMap` from key to
// slot. `find`, `add` and each eviction step are O(1).
//
// Not synchronized. Callers sharing a cache across threads wrap it in their
// own lock.

use std::collections::HashMap;

use bytes::Bytes;
use log::trace;

use crate::diff::config::DEFAULT_CACHE_BYTES;
use crate::error::{DiffError, Result};

/// Cache key: owning reader id and the payload's absolute file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub reader_id: u64,
    pub data_offset: u64,
}

impl CacheKey {
    pub fn new(reader_id: u64, data_offset: u64) -> Self {
        Self {
            reader_id,
            data_offset,
        }
    }
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: CacheKey,
    value: Bytes,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub struct IndexedDiffCache {
    map: HashMap<CacheKey, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
    used_bytes: usize,
    max_bytes: usize,
}

impl Default for IndexedDiffCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BYTES)
    }
}

impl IndexedDiffCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            used_bytes: 0,
            max_bytes,
        }
    }

    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
        self.evict();
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.map.contains_key(key)
    }

    /// Look up `key` and mark it most recently used.
    pub fn find(&mut self, key: &CacheKey) -> Option<Bytes> {
        let idx = *self.map.get(key)?;
        self.unlink(idx);
        self.push_front(idx);
        self.nodes[idx].as_ref().map(|n| n.value.clone())
    }

    /// Insert a new entry as most recently used, then evict from the least
    /// recently used end while over budget. The newest entry always stays.
    pub fn add(&mut self, key: CacheKey, value: Bytes) -> Result<()> {
        if self.map.contains_key(&key) {
            return Err(DiffError::sequence(format!(
                "cache key ({}, {}) added twice",
                key.reader_id, key.data_offset
            )));
        }
        self.used_bytes += value.len();
        let node = Node {
            key,
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                i
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
        self.evict();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.used_bytes = 0;
    }

    /// Keys from most to least recently used.
    pub fn keys_mru(&self) -> Vec<CacheKey> {
        let mut out = Vec::with_capacity(self.map.len());
        let mut i = self.head;
        while i != NIL {
            let Some(n) = self.nodes[i].as_ref() else {
                break;
            };
            out.push(n.key);
            i = n.next;
        }
        out
    }

    fn evict(&mut self) {
        let mut evicted = 0usize;
        while self.used_bytes > self.max_bytes && self.map.len() > 1 {
            let idx = self.tail;
            self.unlink(idx);
            if let Some(n) = self.nodes[idx].take() {
                self.used_bytes -= n.value.len();
                self.map.remove(&n.key);
            }
            self.free.push(idx);
            evicted += 1;
        }
        if evicted > 0 {
            trace!(
                "io cache: evicted {evicted} entries, {} bytes in {} entries",
                self.used_bytes,
                self.map.len()
            );
        }
    }

    fn links(&self, idx: usize) -> (usize, usize) {
        self.nodes[idx]
            .as_ref()
            .map_or((NIL, NIL), |n| (n.prev, n.next))
    }

    fn set_prev(&mut self, idx: usize, prev: usize) {
        if let Some(n) = self.nodes[idx].as_mut() {
            n.prev = prev;
        }
    }

    fn set_next(&mut self, idx: usize, next: usize) {
        if let Some(n) = self.nodes[idx].as_mut() {
            n.next = next;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = self.links(idx);
        if prev == NIL {
            self.head = next;
        } else {
            self.set_next(prev, next);
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.set_prev(next, prev);
        }
        self.set_prev(idx, NIL);
        self.set_next(idx, NIL);
    }

    fn push_front(&mut self, idx: usize) {
        let old = self.head;
        self.set_next(idx, old);
        self.set_prev(idx, NIL);
        if old == NIL {
            self.tail = idx;
        } else {
            self.set_prev(old, idx);
        }
        self.head = idx;
    }
}
