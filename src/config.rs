//! Configuration file reader.
//!
//! The format is plain text, section scoped:
//!
//! ```text
//! WARC-Record-ID:
//!         http://archive.example.com/ 128
//!
//! silo:
//!         directory /archive/silos/
//!         max_size 3.5G
//! ```
//!
//! A `name:` at column 0 opens a section; indented lines are `name arg`
//! entries within it.  `#` starts a comment, blank lines are ignored.
//! Section and entry lookups are case-insensitive; an entry named `*`
//! matches any name in [`Config::find`].

use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug)]
struct Section {
    name:    String,
    entries: Vec<(String, Option<String>)>,
}

#[derive(Debug)]
pub struct Config {
    sections: Vec<Section>,
}

impl Config {
    pub fn read(path: &Path) -> Result<Config> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| Error::Config(format!("{} is not UTF-8", path.display())))?;
        Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    fn parse(text: &str) -> std::result::Result<Config, String> {
        let mut cfg = Config { sections: Vec::new() };
        for raw in text.lines() {
            let line = match raw.find('#') {
                Some(i) => &raw[..i],
                None => raw,
            };
            if line.trim().is_empty() {
                continue;
            }
            if !line.starts_with(char::is_whitespace) {
                let name = line
                    .trim_end()
                    .strip_suffix(':')
                    .ok_or_else(|| format!("section line lacks trailing colon: {raw:?}"))?;
                if name.contains(':') {
                    return Err(format!("section line has stray colon: {raw:?}"));
                }
                if cfg.sections.iter().any(|s| s.name.eq_ignore_ascii_case(name)) {
                    return Err(format!("duplicate section {name:?}"));
                }
                cfg.sections.push(Section {
                    name:    name.to_owned(),
                    entries: Vec::new(),
                });
            } else {
                let sec = cfg
                    .sections
                    .last_mut()
                    .ok_or_else(|| format!("entry before any section: {raw:?}"))?;
                let entry = line.trim();
                match entry.split_once(char::is_whitespace) {
                    Some((name, arg)) => sec
                        .entries
                        .push((name.to_owned(), Some(arg.trim_start().to_owned()))),
                    None => sec.entries.push((entry.to_owned(), None)),
                }
            }
        }
        Ok(cfg)
    }

    /// The single entry of `section` as `(name, arg)`.  It is an error for
    /// the section to hold any other number of entries.
    pub fn get(&self, section: &str) -> Result<(&str, Option<&str>)> {
        let sec = self.section(section)?;
        match sec.entries.as_slice() {
            [(name, arg)] => Ok((name, arg.as_deref())),
            _ => Err(Error::Config(format!(
                "section {section:?} must hold exactly one entry"
            ))),
        }
    }

    /// Look `name` up in `section`; a `*` entry matches anything.
    pub fn find(&self, section: &str, name: &str) -> Option<Option<&str>> {
        let sec = self.section(section).ok()?;
        sec.entries
            .iter()
            .find(|(n, _)| n == "*" || n.eq_ignore_ascii_case(name))
            .map(|(_, a)| a.as_deref())
    }

    /// All entries of `section`, in file order.  Absent sections iterate
    /// as empty.
    pub fn entries<'a>(
        &'a self,
        section: &str,
    ) -> impl Iterator<Item = (&'a str, Option<&'a str>)> {
        let found = self.section(section).ok();
        found
            .map(|s| s.entries.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|(n, a)| (n.as_str(), a.as_deref()))
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.section(section).is_ok()
    }

    fn section(&self, name: &str) -> Result<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Config(format!("section {name:?} not found")))
    }
}

// ── Byte-size grammar ────────────────────────────────────────────────────────

/// Parse a byte count with an optional `k`/`M`/`G`/`T`/`P` (base 2) suffix,
/// an optional trailing `b`/`B`, or a `%` taken relative to `rel`.
pub fn parse_bytes(input: &str, rel: u64) -> std::result::Result<u64, &'static str> {
    let s = input.trim();
    if s.is_empty() {
        return Err("missing number");
    }

    // Numeric prefix: digits with at most one decimal point.
    let mut end = 0;
    let mut dot = false;
    for (i, c) in s.char_indices() {
        match c {
            '0'..='9' => end = i + 1,
            '.' if !dot => {
                dot = true;
                end = i + 1;
            }
            _ => break,
        }
    }
    if end == 0 {
        return Err("invalid number");
    }
    let val: f64 = s[..end].parse().map_err(|_| "invalid number")?;
    let mut rest = s[end..].trim_start();

    if rest == "%" {
        if rel == 0 {
            return Err("absolute number required");
        }
        return Ok((val * rel as f64 / 100.0).round() as u64);
    }

    let mut scale: u64 = 1;
    if let Some(c) = rest.chars().next() {
        scale = match c {
            'k' | 'K' => 1u64 << 10,
            'm' | 'M' => 1u64 << 20,
            'g' | 'G' => 1u64 << 30,
            't' | 'T' => 1u64 << 40,
            'p' | 'P' => 1u64 << 50,
            _ => 0,
        };
        if scale != 0 {
            rest = &rest[1..];
        } else {
            scale = 1;
        }
    }
    if let Some(r) = rest.strip_prefix(['b', 'B']) {
        rest = r;
    }
    if !rest.is_empty() {
        return Err("invalid suffix");
    }
    Ok((val * scale as f64).round() as u64)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# example configuration
WARC-Record-ID:
\thttp://archive.example.com/ 128

silo:
\tdirectory /tmp/aw/     # root
\tmax_size 3.5G

resource.mime-types:
\ttext/plain
\tapplication/octet-stream sha256
";

    #[test]
    fn sections_and_entries() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let (name, arg) = cfg.get("WARC-Record-ID").unwrap();
        assert_eq!(name, "http://archive.example.com/");
        assert_eq!(arg, Some("128"));

        assert_eq!(cfg.find("silo", "directory"), Some(Some("/tmp/aw/")));
        assert_eq!(cfg.find("silo", "max_size"), Some(Some("3.5G")));
        assert_eq!(cfg.find("silo", "nonesuch"), None);
        assert!(cfg.get("silo").is_err());

        assert_eq!(cfg.find("resource.mime-types", "TEXT/PLAIN"), Some(None));
        let names: Vec<_> = cfg.entries("resource.mime-types").map(|(n, _)| n).collect();
        assert_eq!(names, ["text/plain", "application/octet-stream"]);
        assert_eq!(cfg.entries("no.such.section").count(), 0);
    }

    #[test]
    fn wildcard_entry() {
        let cfg = Config::parse("m:\n\t* anything\n").unwrap();
        assert_eq!(cfg.find("m", "whatever/type"), Some(Some("anything")));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Config::parse("\tentry before section\n").is_err());
        assert!(Config::parse("nosection\n").is_err());
        assert!(Config::parse("a:\nb:\na:\n").is_err());
        assert!(Config::parse("a: trailing\n").is_err());
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_bytes("0", 0).unwrap(), 0);
        assert_eq!(parse_bytes("4096", 0).unwrap(), 4096);
        assert_eq!(parse_bytes("10M", 0).unwrap(), 10 << 20);
        assert_eq!(parse_bytes("1kb", 0).unwrap(), 1024);
        assert_eq!(parse_bytes("3.5G", 0).unwrap(), 3758096384);
        assert_eq!(parse_bytes("2 K", 0).unwrap(), 2048);
        assert_eq!(parse_bytes(" 2K ", 0).unwrap(), 2048);
        assert_eq!(parse_bytes("50%", 1000).unwrap(), 500);
        assert_eq!(parse_bytes("50%", 0).unwrap_err(), "absolute number required");
        assert!(parse_bytes("", 0).is_err());
        assert!(parse_bytes("x", 0).is_err());
        assert!(parse_bytes("1q", 0).is_err());
    }
}
