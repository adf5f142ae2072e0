#![no_main]
use libfuzzer_sys::fuzz_target;
use wdiff::diff::SortedDiffReader;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must only ever produce errors, never panics.
    let mut r = SortedDiffReader::new(data);
    if r.read_header().is_err() {
        return;
    }
    while let Ok(Some(x)) = r.read_and_uncompress_diff(true) {
        std::hint::black_box(x);
    }
});
