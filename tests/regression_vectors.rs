// Fixed on-disk layouts. Any change here breaks compatibility with diff
// files already written.

use wdiff::checksum::calc_checksum;
use wdiff::diff::{
    DiffFileHeader, DiffFileType, DiffPackHeader, DiffRecord, IndexedDiffRecord, PackLimits,
};

fn hex_to_bytes(s: &str) -> Vec<u8> {
    let s = s.trim();
    assert!(s.len().is_multiple_of(2), "hex string must have even length");
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

fn uuid_0_to_15() -> uuid::Uuid {
    let mut b = [0u8; 16];
    for (i, x) in b.iter_mut().enumerate() {
        *x = i as u8;
    }
    uuid::Uuid::from_bytes(b)
}

const PAYLOAD_FILL: u8 = 0xAA;
const PAYLOAD_LEN: usize = 1024;

#[test]
fn checksum_vectors() {
    assert_eq!(calc_checksum(&[PAYLOAD_FILL; PAYLOAD_LEN], 0), 0x5555_5600);
    assert_eq!(calc_checksum(&[], 1), 0xffff_ffff);
    // Tail shorter than a word is zero padded.
    assert_eq!(calc_checksum(b"abcde", 0), 0x9b9c_9d3a);
}

#[test]
fn file_header_vectors() {
    let mut h = DiffFileHeader::new(DiffFileType::Sorted, uuid_0_to_15());
    h.set_max_io_blocks_if_necessary(64);
    let want = hex_to_bytes("a5e3dfdb020000000100000040000000000102030405060708090a0b0c0d0e0f");
    assert_eq!(h.encode().to_vec(), want);
    assert_eq!(DiffFileHeader::decode(&want).unwrap(), h);

    let h = DiffFileHeader::new(DiffFileType::Indexed, uuid::Uuid::nil());
    let want = hex_to_bytes("fcffffff02000000020000000000000000000000000000000000000000000000");
    assert_eq!(h.encode().to_vec(), want);
    assert_eq!(DiffFileHeader::decode(&want).unwrap(), h);
}

#[test]
fn sorted_record_vectors() {
    let data = [PAYLOAD_FILL; PAYLOAD_LEN];
    let cases = [
        (
            DiffRecord::normal(0x1234, 2, &data),
            "3412000000000000020000000100000000000000000400000056555500000000",
        ),
        (
            DiffRecord::all_zero(100, 8),
            "6400000000000000080000000300000000000000000000000000000000000000",
        ),
        (
            DiffRecord::discard(7, 3),
            "0700000000000000030000000500000000000000000000000000000000000000",
        ),
    ];
    for (rec, hex) in cases {
        let want = hex_to_bytes(hex);
        assert_eq!(rec.encode().to_vec(), want, "{rec}");
        assert_eq!(DiffRecord::decode(&want).unwrap(), rec);
    }
}

#[test]
fn indexed_record_vector() {
    let data = [PAYLOAD_FILL; PAYLOAD_LEN];
    let mut rec = IndexedDiffRecord {
        data_offset: 32,
        ..IndexedDiffRecord::normal(0x1234, 2, &data)
    };
    let want = hex_to_bytes(
        "341200000000000020000000000000000200000002000000000000000004000000565555a793aaaa0100000000000000",
    );
    assert_eq!(rec.encode().to_vec(), want);
    rec.update_rec_checksum();
    assert_eq!(rec.rec_checksum, 0xaaaa_93a7);
    assert_eq!(IndexedDiffRecord::decode(&want).unwrap(), rec);
}

#[test]
fn pack_header_vectors() {
    let data = [PAYLOAD_FILL; PAYLOAD_LEN];
    let mut pack = DiffPackHeader::new(PackLimits::default());
    assert!(pack.add(&DiffRecord::normal(0x1234, 2, &data)));
    let b = pack.encode();
    assert_eq!(b.len(), 4096);
    let want = hex_to_bytes(
        "c88faaaa0100000000040000000000003412000000000000020000000100000000000000000400000056555500000000",
    );
    assert_eq!(&b[..want.len()], &want[..]);
    assert!(b[want.len()..].iter().all(|&x| x == 0));
    let back = DiffPackHeader::decode(&b).unwrap();
    assert_eq!(back.n_records(), 1);
    assert_eq!(back.total_size(), PAYLOAD_LEN as u32);

    let end = DiffPackHeader::end_marker().encode();
    assert_eq!(&end[..16], &hex_to_bytes("0000ffff000001000000000000000000")[..]);
    assert!(end[16..].iter().all(|&x| x == 0));
    assert!(DiffPackHeader::decode(&end).unwrap().is_end());
}

#[test]
fn unknown_tags_are_rejected() {
    let mut b = DiffFileHeader::default().encode();
    b[4] = 3;
    assert!(DiffFileHeader::decode(&b).is_err());

    let mut r = DiffRecord::all_zero(0, 1).encode();
    r[13] = 9;
    assert!(DiffRecord::decode(&r).is_err());
    let mut r = DiffRecord::all_zero(0, 1).encode();
    r[12] = 0x10;
    assert!(DiffRecord::decode(&r).is_err());
}
