use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::tempdir;
use wdiff::diff::config::blocks_to_bytes;
use wdiff::diff::{CompressOptions, DiffFileHeader, DiffRecord, SortedDiffWriter};

fn bin() -> String {
    env!("CARGO_BIN_EXE_wdiff").to_string()
}

fn write_sorted(dir: &Path, name: &str, ios: &[(u64, u32, u8)]) -> PathBuf {
    let path = dir.join(name);
    let mut w = SortedDiffWriter::new(BufWriter::new(File::create(&path).unwrap()));
    w.write_header(&mut DiffFileHeader::default()).unwrap();
    for &(addr, blocks, fill) in ios {
        let data = vec![fill; blocks_to_bytes(blocks)];
        w.compress_and_write_diff(
            &DiffRecord::normal(addr, blocks, &data),
            &data,
            CompressOptions::default(),
        )
        .unwrap();
    }
    w.finish().unwrap().flush().unwrap();
    path
}

#[test]
fn cli_show_lists_records() {
    let dir = tempdir().unwrap();
    let a = write_sorted(dir.path(), "a.wdiff", &[(0, 2, 1), (8, 1, 2)]);
    let out = Command::new(bin()).arg("show").arg(&a).output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    // Header line plus one line per record.
    assert_eq!(text.lines().count(), 3);

    let out = Command::new(bin())
        .args(["show", "--stat-only"])
        .arg(&a)
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.contains("nrN 2"), "{text}");
}

#[test]
fn cli_merge_then_full() {
    let dir = tempdir().unwrap();
    let a = write_sorted(dir.path(), "a.wdiff", &[(0, 4, 0x11)]);
    let b = write_sorted(dir.path(), "b.wdiff", &[(2, 4, 0x22)]);
    let merged = dir.path().join("m.wdiff");
    let st = Command::new(bin())
        .arg("merge")
        .arg(&a)
        .arg(&b)
        .arg("-o")
        .arg(&merged)
        .args(["--compression", "gzip"])
        .status()
        .unwrap();
    assert!(st.success());

    let base = dir.path().join("base.img");
    std::fs::write(&base, vec![0xEEu8; blocks_to_bytes(8)]).unwrap();
    let img = dir.path().join("out.img");
    let st = Command::new(bin())
        .arg("full")
        .arg("-b")
        .arg(&base)
        .arg(&merged)
        .arg("-o")
        .arg(&img)
        .status()
        .unwrap();
    assert!(st.success());
    let data = std::fs::read(&img).unwrap();
    let fills: Vec<u8> = data.chunks(512).map(|b| b[0]).collect();
    assert_eq!(fills, vec![0x11, 0x11, 0x22, 0x22, 0x22, 0x22, 0xEE, 0xEE]);
}

#[test]
fn cli_full_streams_stdin_to_stdout() {
    let dir = tempdir().unwrap();
    let a = write_sorted(dir.path(), "a.wdiff", &[(1, 1, 0x5A)]);
    let mut child = Command::new(bin())
        .arg("full")
        .arg(&a)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    {
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(&vec![0u8; blocks_to_bytes(3)]).unwrap();
    }
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());
    assert_eq!(out.stdout.len(), blocks_to_bytes(3));
    assert!(out.stdout[512..1024].iter().all(|&b| b == 0x5A));
    assert!(out.stdout[1024..].iter().all(|&b| b == 0));
}

#[test]
fn cli_index_and_json_stats() {
    let dir = tempdir().unwrap();
    let a = write_sorted(dir.path(), "a.wdiff", &[(0, 2, 1), (4, 2, 2)]);
    let idx = dir.path().join("a.idx");
    let out = Command::new(bin())
        .arg("--json")
        .arg("index")
        .arg(&a)
        .arg(&idx)
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stderr).unwrap();
    assert_eq!(v["command"], "index");
    assert_eq!(v["records"], 2);
    assert_eq!(v["stat"]["normal_lb"], 4);

    let out = Command::new(bin())
        .args(["--json", "show", "--stat-only"])
        .arg(&idx)
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stderr).unwrap();
    assert_eq!(v["type"], "indexed");
    assert_eq!(v["stat"]["normal_nr"], 2);
}

#[test]
fn cli_refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();
    let a = write_sorted(dir.path(), "a.wdiff", &[(0, 1, 1)]);
    let out_path = dir.path().join("exists.wdiff");
    std::fs::write(&out_path, b"keep").unwrap();

    let st = Command::new(bin())
        .arg("merge")
        .arg(&a)
        .arg("-o")
        .arg(&out_path)
        .status()
        .unwrap();
    assert!(!st.success());
    assert_eq!(std::fs::read(&out_path).unwrap(), b"keep");

    let st = Command::new(bin())
        .arg("-f")
        .arg("merge")
        .arg(&a)
        .arg("-o")
        .arg(&out_path)
        .status()
        .unwrap();
    assert!(st.success());
}

#[test]
fn cli_rejects_garbage_input() {
    let dir = tempdir().unwrap();
    let junk = dir.path().join("junk");
    std::fs::write(&junk, vec![0x42u8; 100]).unwrap();
    let out = Command::new(bin()).arg("show").arg(&junk).output().unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("wdiff: show"));
}
