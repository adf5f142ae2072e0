// Last-writer-wins overlap elimination over an address-keyed map.
//
// Shared by the indexed writer's `DiffIndexMem` and the merger's
// `DiffMemory`. Both keep a `BTreeMap<io_address, T>` whose entries are
// sorted and pairwise non-overlapping; inserting a new extent first cuts
// away every part of the existing entries it covers.

use std::collections::BTreeMap;

use crate::error::{DiffError, Result};

/// A block range that can be cut and split.
pub trait Extent: Sized {
    fn io_address(&self) -> u64;

    fn io_blocks(&self) -> u32;

    fn end_io_address(&self) -> u64 {
        self.io_address() + u64::from(self.io_blocks())
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.io_address() < other.end_io_address() && other.io_address() < self.end_io_address()
    }

    /// Parts of `self` not covered by `other` (0, 1 or 2 fragments, in
    /// address order). Errors if the extents do not overlap.
    fn minus(&self, other: &Self) -> Result<Vec<Self>>;

    /// Pieces of at most `max_blocks` blocks. `max_blocks == 0` means no cap.
    fn split(&self, max_blocks: u32) -> Vec<Self>;
}

/// Remove everything `rec` overlaps from `map`, re-inserting the uncovered
/// fragments (split to `max_blocks`). The caller inserts `rec` afterwards.
///
/// Returns the number of entries removed.
pub(crate) fn cut_overlaps<T: Extent>(
    map: &mut BTreeMap<u64, T>,
    rec: &T,
    max_blocks: u32,
) -> Result<usize> {
    let start = rec.io_address();
    let Some(end) = start.checked_add(u64::from(rec.io_blocks())) else {
        return Err(DiffError::format(format!(
            "extent {start}+{} overflows the address space",
            rec.io_blocks()
        )));
    };

    // The entry just before `start` may reach into the new range.
    let mut keys = Vec::new();
    if let Some((&k, prev)) = map.range(..start).next_back()
        && prev.end_io_address() > start
    {
        keys.push(k);
    }
    keys.extend(map.range(start..end).map(|(&k, _)| k));

    let removed = keys.len();
    for k in keys {
        let Some(old) = map.remove(&k) else {
            continue;
        };
        for frag in old.minus(rec)? {
            for piece in frag.split(max_blocks) {
                map.insert(piece.io_address(), piece);
            }
        }
    }
    Ok(removed)
}

/// Check that entries are keyed by their address, sorted and
/// non-overlapping.
pub(crate) fn check_sorted<T: Extent>(map: &BTreeMap<u64, T>) -> Result<()> {
    let mut prev_end: Option<u64> = None;
    for (&k, rec) in map {
        if k != rec.io_address() {
            return Err(DiffError::sequence(format!(
                "entry keyed at {k} has address {}",
                rec.io_address()
            )));
        }
        if let Some(pe) = prev_end
            && rec.io_address() < pe
        {
            return Err(DiffError::sequence(format!(
                "overlap: entry at {} starts before previous end {pe}",
                rec.io_address()
            )));
        }
        prev_end = Some(rec.end_io_address());
    }
    Ok(())
}

/// Bounds of the parts of `[a, a_end)` left uncovered by `[b, b_end)`.
pub(crate) fn uncovered(a: u64, a_end: u64, b: u64, b_end: u64) -> Result<[Option<(u64, u64)>; 2]> {
    if !(a < b_end && b < a_end) {
        return Err(DiffError::sequence(format!(
            "minus on non-overlapping ranges [{a}, {a_end}) and [{b}, {b_end})"
        )));
    }
    let left = (a < b).then_some((a, b));
    let right = (b_end < a_end).then_some((b_end, a_end));
    Ok([left, right])
}
