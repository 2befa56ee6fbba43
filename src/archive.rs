//! The archive handle — validated configuration plus the `_.cache` hints.
//!
//! One [`Archive`] describes one store: the id prefix and size, the silo
//! tree location, the per-silo size cap, and the index merge chunk size.
//! It is created once at process start and threaded as `&Archive` through
//! every operation.
//!
//! The handle also carries two advisory counters persisted in `_.cache`
//! (big-endian u32 pair):
//!
//! - `first_non_silo` — lowest silo number that might not exist yet; the
//!   writer's allocation scan starts here.
//! - `first_space_silo` — lowest silo number the append optimization might
//!   still fit something into; the append scan starts here.
//!
//! Both only ever grow.  The file is a hint: if it is absent, truncated or
//! stale, everything still works, just slower.

use std::cell::Cell;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use log::warn;

use crate::config::{self, Config};
use crate::error::{Error, Result};

const CACHE_FILE: &str = "_.cache";

/// Parsed `silo.basename` template: exactly one `%u`-style directive.
#[derive(Debug)]
struct Basename {
    head:  String,
    tail:  String,
    width: usize,
    zero:  bool,
}

impl Basename {
    fn parse(t: &str) -> std::result::Result<Basename, &'static str> {
        if t.contains('/') {
            return Err("cannot contain '/'");
        }
        let pct = t.find('%').ok_or("must contain one %u pattern")?;
        let rest = &t[pct + 1..];
        let zero = rest.starts_with('0');
        let digits: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let width: usize = if digits.is_empty() {
            0
        } else {
            digits.parse().map_err(|_| "bad field width")?
        };
        let rest = &rest[digits.len()..];
        let tail = rest.strip_prefix('u').ok_or("must contain one %u pattern")?;
        if tail.contains('%') {
            return Err("must contain exactly one %u pattern");
        }
        Ok(Basename {
            head: t[..pct].to_owned(),
            tail: tail.to_owned(),
            width,
            zero,
        })
    }

    fn expand(&self, n: u32) -> String {
        let num = if self.zero {
            format!("{:01$}", n, self.width.max(1))
        } else {
            format!("{:1$}", n, self.width)
        };
        format!("{}{}{}", self.head, num, self.tail)
    }
}

pub struct Archive {
    cfg:             Config,
    prefix:          String,
    id_size:         usize,
    silo_dirname:    PathBuf,
    silo_basename:   Basename,
    silo_max_size:   u64,
    index_sort_size: u64,

    first_non_silo:   Cell<u32>,
    first_space_silo: Cell<u32>,
}

impl Archive {
    /// Load and validate the configuration; the counters start at zero
    /// until [`read_cache`] is called.
    ///
    /// [`read_cache`]: Archive::read_cache
    pub fn open(config_file: &Path) -> Result<Archive> {
        let cfg = Config::read(config_file)?;

        let (prefix, bits) = cfg.get("WARC-Record-ID")?;
        if !prefix.ends_with('/') {
            return Err(Error::Config("'WARC-Record-ID' must end in '/'".into()));
        }
        let id_size = match bits {
            None => 32,
            Some(b) => {
                let bits: u32 = b
                    .parse()
                    .map_err(|_| Error::Config(format!("bad 'WARC-Record-ID' size {b:?}")))?;
                if !(64..=256).contains(&bits) || bits % 4 != 0 {
                    return Err(Error::Config(
                        "'WARC-Record-ID' size must be 64-256 bits, divisible by 4".into(),
                    ));
                }
                (bits / 4) as usize
            }
        };
        let prefix = prefix.to_owned();

        let dirname = match cfg.find("silo", "directory") {
            Some(Some(d)) => d.to_owned(),
            _ => return Err(Error::Config("'silo.directory' not found".into())),
        };
        if !dirname.ends_with('/') {
            return Err(Error::Config("'silo.directory' must end in '/'".into()));
        }

        let max_size = match cfg.find("silo", "max_size") {
            Some(Some(v)) => config::parse_bytes(v, 0)
                .map_err(|e| Error::Config(format!("'silo.max_size' {v:?}: {e}")))?,
            _ => 3_758_096_384, // 3.5G
        };

        let basename = match cfg.find("silo", "basename") {
            Some(Some(v)) => v.to_owned(),
            _ => "%08u.warc.gz".to_owned(),
        };
        let silo_basename = Basename::parse(&basename)
            .map_err(|e| Error::Config(format!("'silo.basename' {basename:?}: {e}")))?;

        let sort_size = match cfg.find("index", "sort_size") {
            Some(Some(v)) => config::parse_bytes(v, 0)
                .map_err(|e| Error::Config(format!("'index.sort_size' {v:?}: {e}")))?,
            _ => 10 << 20,
        } & !0x1f;
        if sort_size < 4096 {
            return Err(Error::Config("'index.sort_size' is too small (>= 4k)".into()));
        }

        Ok(Archive {
            cfg,
            prefix,
            id_size,
            silo_dirname: PathBuf::from(dirname),
            silo_basename,
            silo_max_size: max_size,
            index_sort_size: sort_size,
            first_non_silo: Cell::new(0),
            first_space_silo: Cell::new(0),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// The URI-like prefix all record ids live under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Record id width in hex characters (4 bits each).
    pub fn id_size(&self) -> usize {
        self.id_size
    }

    pub fn silo_dirname(&self) -> &Path {
        &self.silo_dirname
    }

    pub fn silo_basename(&self, number: u32) -> String {
        self.silo_basename.expand(number)
    }

    pub fn silo_max_size(&self) -> u64 {
        self.silo_max_size
    }

    pub fn index_sort_size(&self) -> u64 {
        self.index_sort_size
    }

    // ── The _.cache counters ─────────────────────────────────────────────────

    pub fn first_non_silo(&self) -> u32 {
        self.first_non_silo.get()
    }

    pub fn first_space_silo(&self) -> u32 {
        self.first_space_silo.get()
    }

    /// Refresh both counters from `_.cache`; absent or short files leave
    /// them untouched.
    pub fn read_cache(&self) {
        let mut buf = [0u8; 8];
        let path = self.silo_dirname.join(CACHE_FILE);
        if let Ok(mut f) = fs::File::open(&path) {
            if f.read_exact(&mut buf).is_ok() {
                // Monotonic: a stale file never moves a counter backwards.
                let non = BigEndian::read_u32(&buf[0..4]);
                let space = BigEndian::read_u32(&buf[4..8]);
                self.first_non_silo.set(self.first_non_silo.get().max(non));
                self.first_space_silo
                    .set(self.first_space_silo.get().max(space));
            }
        }
    }

    pub fn write_cache(&self) {
        let mut buf = [0u8; 8];
        BigEndian::write_u32(&mut buf[0..4], self.first_non_silo.get());
        BigEndian::write_u32(&mut buf[4..8], self.first_space_silo.get());
        let path = self.silo_dirname.join(CACHE_FILE);
        if let Err(e) = fs::write(&path, buf) {
            warn!("cannot persist {}: {e}", path.display());
        }
    }

    pub fn bump_first_non_silo(&self) {
        self.first_non_silo.set(self.first_non_silo.get() + 1);
        self.write_cache();
    }

    pub fn bump_first_space_silo(&self) {
        self.first_space_silo.set(self.first_space_silo.get() + 1);
        self.write_cache();
    }
}

// ── Test scaffolding ─────────────────────────────────────────────────────────

/// Build a throwaway archive rooted in a tempdir.  `silo_lines` go verbatim
/// under the `silo:` section, `extra` as whole config lines at the end.
#[cfg(test)]
pub fn test_archive_with(silo_lines: &[&str], extra: &[&str]) -> (tempfile::TempDir, Archive) {
    use std::fmt::Write;

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
    let cfg_path = dir.path().join("aardwarc.conf");
    std::fs::write(&cfg_path, cfg).unwrap();
    let aa = Archive::open(&cfg_path).unwrap();
    (dir, aa)
}

#[cfg(test)]
pub fn test_archive(silo_lines: &[&str]) -> (tempfile::TempDir, Archive) {
    test_archive_with(silo_lines, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let (_t, aa) = test_archive(&[]);
        assert_eq!(aa.id_size(), 32);
        assert_eq!(aa.prefix(), "http://test.example/aw/");
        assert_eq!(aa.silo_max_size(), 3_758_096_384);
        assert_eq!(aa.index_sort_size(), 10 << 20);
        assert_eq!(aa.silo_basename(7), "00000007.warc.gz");
    }

    #[test]
    fn basename_templates() {
        for (t, n, want) in [
            ("%08u.warc.gz", 42u32, "00000042.warc.gz"),
            ("silo-%u.warc.gz", 42, "silo-42.warc.gz"),
            ("%03u", 4242, "4242"),
        ] {
            assert_eq!(Basename::parse(t).unwrap().expand(n), want);
        }
        for bad in ["plain.warc.gz", "%d.warc.gz", "%u-%u", "a/%u"] {
            assert!(Basename::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn cache_roundtrip_and_monotonicity() {
        let (_t, aa) = test_archive(&[]);
        aa.first_non_silo.set(5);
        aa.first_space_silo.set(3);
        aa.write_cache();

        let cfg = _t.path().join("aardwarc.conf");
        let aa2 = Archive::open(&cfg).unwrap();
        aa2.read_cache();
        assert_eq!(aa2.first_non_silo(), 5);
        assert_eq!(aa2.first_space_silo(), 3);

        // A stale cache file cannot move live counters backwards.
        aa2.first_non_silo.set(9);
        aa2.read_cache();
        assert_eq!(aa2.first_non_silo(), 9);
    }

    #[test]
    fn bad_configs() {
        let dir = tempfile::tempdir().unwrap();
        for body in [
            "silo:\n\tdirectory /tmp/x/\n",
            "WARC-Record-ID:\n\thttp://e/ 128\n",
            "WARC-Record-ID:\n\thttp://e\nsilo:\n\tdirectory /x/\n",
            "WARC-Record-ID:\n\thttp://e/ 62\nsilo:\n\tdirectory /x/\n",
            "WARC-Record-ID:\n\thttp://e/ 512\nsilo:\n\tdirectory /x/\n",
            "WARC-Record-ID:\n\thttp://e/\nsilo:\n\tdirectory /x\n",
            "WARC-Record-ID:\n\thttp://e/\nsilo:\n\tdirectory /x/\n\tbasename a/%u\n",
            "WARC-Record-ID:\n\thttp://e/\nsilo:\n\tdirectory /x/\nindex:\n\tsort_size 64\n",
        ] {
            let p = dir.path().join("c.conf");
            std::fs::write(&p, body).unwrap();
            assert!(Archive::open(&p).is_err(), "accepted: {body:?}");
        }
    }
}
