//! Silo file naming — adaptive directory fan-out.
//!
//! No directory should hold more than 100 silos, but the tree depth must
//! not be committed up front.  Silo numbers therefore map to a hierarchy
//! keyed by their magnitude:
//!
//! ```text
//! prefix/0/{100 silos}
//! prefix/1/{100 subdirs}/{100 silos}
//! prefix/2/{100 subdirs}/{100 subdirs}/{100 silos}
//! ...
//! ```
//!
//! Level `L` is the smallest value with `n < 100^(L+1)`.  A writer's
//! exclusivity marker is the silo path suffixed `.hold`; a permanently
//! archived silo is marked by the sidecar suffixed `.seal`.

use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::error::Result;

fn numpart(out: &mut String, lvl: u32, num: u32) {
    if num >= 100 {
        numpart(out, lvl + 1, num / 100);
    } else {
        out.push_str(&format!("{lvl}/"));
    }
    if lvl > 0 {
        out.push_str(&format!("{:02}/", num % 100));
    }
}

/// Directory that holds (or would hold) silo `number`.
fn dirpart(aa: &Archive, number: u32) -> PathBuf {
    let mut part = String::new();
    numpart(&mut part, 0, number);
    aa.silo_dirname().join(part)
}

pub fn filename(aa: &Archive, number: u32) -> PathBuf {
    dirpart(aa, number).join(aa.silo_basename(number))
}

/// The writer's exclusivity marker for silo `number`.
pub fn hold_filename(aa: &Archive, number: u32) -> PathBuf {
    suffixed(&filename(aa, number), ".hold")
}

/// Sidecar marking silo `number` permanently archived; the append scan
/// stops at the first silo carrying one.
pub fn seal_filename(aa: &Archive, number: u32) -> PathBuf {
    suffixed(&filename(aa, number), ".seal")
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Visit existing silo files in increasing number order.  The scan stops
/// at the first silo number whose parent directory does not exist; numbers
/// whose directory exists but whose file is missing are skipped.
pub fn iter(aa: &Archive, mut f: impl FnMut(&Path, u32) -> Result<()>) -> Result<()> {
    for number in 0u32.. {
        if !dirpart(aa, number).is_dir() {
            break;
        }
        let path = filename(aa, number);
        if path.is_file() {
            f(&path, number)?;
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_archive;

    fn rel(aa: &Archive, n: u32) -> String {
        filename(aa, n)
            .strip_prefix(aa.silo_dirname())
            .unwrap()
            .display()
            .to_string()
    }

    #[test]
    fn fan_out_levels() {
        let (_t, aa) = test_archive(&[]);
        assert_eq!(rel(&aa, 0), "0/00000000.warc.gz");
        assert_eq!(rel(&aa, 99), "0/00000099.warc.gz");
        assert_eq!(rel(&aa, 100), "1/01/00000100.warc.gz");
        assert_eq!(rel(&aa, 9_999), "1/99/00009999.warc.gz");
        assert_eq!(rel(&aa, 10_000), "2/01/00/00010000.warc.gz");
        assert_eq!(rel(&aa, 123_456), "2/12/34/00123456.warc.gz");
    }

    #[test]
    fn sidecar_names() {
        let (_t, aa) = test_archive(&[]);
        assert!(hold_filename(&aa, 3).to_str().unwrap().ends_with(".warc.gz.hold"));
        assert!(seal_filename(&aa, 3).to_str().unwrap().ends_with(".warc.gz.seal"));
    }

    #[test]
    fn iteration_order_and_stop() {
        let (_t, aa) = test_archive(&[]);
        for n in [0u32, 1, 2] {
            let p = filename(&aa, n);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(&p, b"x").unwrap();
        }
        // A gap: directory exists but the file for 3 does not.
        let mut seen = Vec::new();
        iter(&aa, |_, n| {
            seen.push(n);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, [0, 1, 2]);
    }
}
