#![no_main]
use libfuzzer_sys::fuzz_target;
use wdiff::diff::config::blocks_to_bytes;
use wdiff::diff::{
    CompressOptions, DiffFileHeader, DiffMerger, DiffRecord, SortedDiffReader, SortedDiffStream,
    SortedDiffWriter,
};

// Each 4-byte chunk is one IO: stream, gap, length, fill.
fuzz_target!(|data: &[u8]| {
    let mut streams: Vec<Vec<(u64, u32, u8)>> = vec![Vec::new(); 3];
    let mut next = [0u64; 3];
    for c in data.chunks_exact(4).take(256) {
        let s = c[0] as usize % 3;
        let addr = next[s] + u64::from(c[1] % 16);
        let blocks = u32::from(c[2] % 16) + 1;
        streams[s].push((addr, blocks, c[3]));
        next[s] = addr + u64::from(blocks);
    }

    let mut m = DiffMerger::new();
    m.set_max_io_blocks(u32::from(data.first().copied().unwrap_or(0) % 8));
    for ios in &streams {
        let mut w = SortedDiffWriter::new(Vec::new());
        w.write_header(&mut DiffFileHeader::default()).unwrap();
        for &(addr, blocks, fill) in ios {
            let io = vec![fill; blocks_to_bytes(blocks)];
            w.write_diff(&DiffRecord::normal(addr, blocks, &io), &io).unwrap();
        }
        let buf = w.finish().unwrap();
        let src = SortedDiffStream::new(SortedDiffReader::new(std::io::Cursor::new(buf))).unwrap();
        m.add_wdiff(Box::new(src)).unwrap();
    }

    // Output must be sorted and non-overlapping.
    let mut last_end = 0;
    while let Some(r) = m.get_and_remove().unwrap() {
        assert!(r.record().io_address >= last_end);
        last_end = r.record().end_io_address();
    }
    let _ = m.merge_to(Vec::new(), CompressOptions::none());
});
