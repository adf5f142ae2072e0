// walb additive checksum.
//
// The checksum is the wrapping sum of the input viewed as little-endian u32
// words (a short tail is zero-padded), seeded with a salt, then negated in
// two's complement. Structures that carry their own checksum field are
// "self-verifying": the checksum is computed with the field zeroed and then
// stored, so summing the whole structure again (stored field included)
// yields zero.

/// Add `data` to a running partial sum.
pub fn checksum_partial(data: &[u8], mut csum: u32) -> u32 {
    let mut chunks = data.chunks_exact(4);
    for w in &mut chunks {
        csum = csum.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut w = [0u8; 4];
        w[..tail.len()].copy_from_slice(tail);
        csum = csum.wrapping_add(u32::from_le_bytes(w));
    }
    csum
}

/// Turn a partial sum into the stored checksum value.
#[inline]
pub fn checksum_finish(csum: u32) -> u32 {
    (!csum).wrapping_add(1)
}

/// Checksum of `data` seeded with `salt`.
pub fn calc_checksum(data: &[u8], salt: u32) -> u32 {
    checksum_finish(checksum_partial(data, salt))
}

/// Compute the checksum of a self-verifying structure serialized in `buf`
/// whose checksum field lives at `buf[field..field + 4]`, and store it.
pub(crate) fn seal(buf: &mut [u8], field: usize, salt: u32) -> u32 {
    buf[field..field + 4].fill(0);
    let csum = calc_checksum(buf, salt);
    buf[field..field + 4].copy_from_slice(&csum.to_le_bytes());
    csum
}

/// Whether a serialized self-verifying structure sums to zero.
pub(crate) fn is_sealed(buf: &[u8], salt: u32) -> bool {
    calc_checksum(buf, salt) == 0
}
