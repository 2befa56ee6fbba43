#![allow(dead_code)] // each test binary uses a different subset

use std::fmt::Write;
use std::path::PathBuf;

use aardwarc::archive::Archive;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// Build a scratch archive.  `silo_lines` go under the `silo:` section,
/// `extra` are appended as whole configuration lines.
pub fn archive(silo_lines: &[&str], extra: &[&str]) -> (TempDir, Archive) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = String::new();
    writeln!(cfg, "WARC-Record-ID:").unwrap();
    writeln!(cfg, "\thttp://test.example/aw/ 128").unwrap();
    writeln!(cfg, "silo:").unwrap();
    writeln!(cfg, "\tdirectory {}/", dir.path().display()).unwrap();
    for l in silo_lines {
        writeln!(cfg, "\t{l}").unwrap();
    }
    for l in extra {
        writeln!(cfg, "{l}").unwrap();
    }
    let path = config_path(&dir);
    std::fs::write(&path, cfg).unwrap();
    let aa = Archive::open(&path).unwrap();
    (dir, aa)
}

pub fn config_path(dir: &TempDir) -> PathBuf {
    dir.path().join("aardwarc.conf")
}

/// Deterministic test payload: SHA-256 in counter mode over its own
/// previous output.
pub fn test_bytes(mut n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    let mut dig = [0u8; 32];
    while n > 0 {
        dig = Sha256::digest(dig).into();
        let take = n.min(dig.len());
        out.extend_from_slice(&dig[..take]);
        n -= take;
    }
    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
