#![no_main]
use libfuzzer_sys::fuzz_target;
use wdiff::diff::{IndexedDiffCache, IndexedDiffReader};

fuzz_target!(|data: &[u8]| {
    let Ok(mut r) = IndexedDiffReader::from_bytes(data.to_vec()) else {
        return;
    };
    let mut cache = IndexedDiffCache::new(64 * 1024);
    while let Ok(Some(x)) = r.read_diff(&mut cache) {
        std::hint::black_box(x);
    }
});
