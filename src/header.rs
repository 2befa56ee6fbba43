//! WARC record headers — an insertion-ordered key/value store with a
//! fixed-width record-id slot.
//!
//! Fields are kept sorted case-insensitively by name so that serialization
//! is deterministic.  The record id is not an ordinary field: it lives in a
//! fixed slot of exactly `id_size` hex characters (underscores until set),
//! is always serialized as the first header line, and [`Header::set`]
//! rejects any attempt to smuggle it in as a field.
//!
//! `parse` accepts only this store's own dialect — it is *not* a general
//! WARC header parser.

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::gzip;

/// Cost in serialized bytes of one `name: value\r\n` line.  This is the
/// primitive the segment writer uses to reserve header padding for fields
/// whose value is only known later; it must stay exactly in step with
/// [`Header::serialize`].
pub fn field_len(name: &str, value: &str) -> usize {
    name.len() + 2 + value.len() + 2
}

#[derive(Debug, Clone)]
pub struct Header {
    prefix:    String,
    id_size:   usize,
    record_id: String,
    /// Sorted case-insensitively by name; names are unique.
    fields:    Vec<(String, String)>,
}

impl Header {
    pub fn new(aa: &Archive) -> Self {
        Header {
            prefix:    aa.prefix().to_owned(),
            id_size:   aa.id_size(),
            record_id: "_".repeat(aa.id_size()),
            fields:    Vec::new(),
        }
    }

    // ── Fields ───────────────────────────────────────────────────────────────

    /// Insert or replace a field, keeping the case-insensitive order.
    ///
    /// Panics on `WARC-Record-ID` (use [`set_id`]) and on names containing
    /// a colon; both are caller bugs, not input errors.
    ///
    /// [`set_id`]: Header::set_id
    pub fn set(&mut self, name: &str, value: impl ToString) {
        assert!(!name.contains(':'), "field name contains colon: {name}");
        assert!(
            !name.eq_ignore_ascii_case("WARC-Record-ID"),
            "WARC-Record-ID is not an ordinary field"
        );
        let value = value.to_string();
        if let Some(f) = self
            .fields
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            f.1 = value;
            return;
        }
        let at = self
            .fields
            .partition_point(|(n, _)| cmp_name(n, name) == std::cmp::Ordering::Less);
        self.fields.insert(at, (name.to_owned(), value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Decimal value of a field, or −1 if it is missing, not a plain run
    /// of digits, or too large to represent.
    pub fn get_number(&self, name: &str) -> i128 {
        let Some(v) = self.get(name) else { return -1 };
        let mut r: i128 = 0;
        for c in v.bytes() {
            if !c.is_ascii_digit() {
                return -1;
            }
            r = match r
                .checked_mul(10)
                .and_then(|r| r.checked_add(i128::from(c - b'0')))
            {
                Some(r) => r,
                None => return -1,
            };
        }
        r
    }

    // ── The id slot ──────────────────────────────────────────────────────────

    pub fn get_id(&self) -> &str {
        &self.record_id
    }

    /// Copy the first `id_size` characters of a hex digest into the id slot.
    pub fn set_id(&mut self, digest: &str) {
        assert!(digest.chars().all(|c| c.is_ascii_graphic()));
        assert!(digest.len() >= self.id_size);
        self.record_id = digest[..self.id_size].to_owned();
    }

    /// Store a reference field as `<prefix + digest>`, truncated to id size.
    pub fn set_ref(&mut self, name: &str, digest: &str) {
        assert!(digest.len() >= self.id_size);
        let r = format!("<{}{}>", self.prefix, &digest[..self.id_size]);
        self.set(name, r);
    }

    pub fn set_date(&mut self) {
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        self.set("WARC-Date", now);
    }

    // ── Wire form ────────────────────────────────────────────────────────────

    /// Serialize; `level` −1 returns the plain text, 0–9 wraps it in an Aa
    /// gzip member at that compression level.
    pub fn serialize(&self, level: i32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(b"WARC/1.1\r\n");
        out.extend_from_slice(b"WARC-Record-ID: <");
        out.extend_from_slice(self.prefix.as_bytes());
        out.extend_from_slice(self.record_id.as_bytes());
        out.extend_from_slice(b">\r\n");
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        if level < 0 {
            return Ok(out);
        }
        gzip::encode_vsb(&out, level as u32)
    }

    /// Strict parse of a header this store serialized itself.
    pub fn parse(aa: &Archive, text: &[u8]) -> Result<Header> {
        let bad = |what: &str| Error::BadFormat(format!("record header: {what}"));
        let text = std::str::from_utf8(text).map_err(|_| bad("not UTF-8"))?;

        let mut hd = Header {
            prefix:    aa.prefix().to_owned(),
            id_size:   aa.id_size(),
            record_id: String::new(),
            fields:    Vec::new(),
        };

        let rest = text
            .strip_prefix("WARC/1.1\r\n")
            .ok_or_else(|| bad("missing WARC/1.1 version line"))?;

        let mut lines = rest.split("\r\n");
        let mut seen_end = false;
        for line in &mut lines {
            if line.is_empty() {
                seen_end = true;
                break;
            }
            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| bad("field without ': ' separator"))?;
            if !name.eq_ignore_ascii_case("WARC-Record-ID") {
                if name.contains(':') || hd.get(name).is_some() {
                    return Err(bad("malformed or duplicate field name"));
                }
                hd.set(name, value);
                continue;
            }
            let uri = value
                .strip_prefix('<')
                .and_then(|v| v.strip_suffix('>'))
                .ok_or_else(|| bad("record id not bracketed"))?;
            let slash = uri.rfind('/').ok_or_else(|| bad("record id has no prefix"))?;
            let (prefix, id) = uri.split_at(slash + 1);
            if prefix != hd.prefix {
                return Err(bad("record id under foreign prefix"));
            }
            if id.len() != hd.id_size || !id.bytes().all(|b| b.is_ascii_graphic()) {
                return Err(bad("record id has wrong width"));
            }
            hd.record_id = id.to_owned();
        }
        if !seen_end || hd.record_id.is_empty() {
            return Err(bad("truncated or id-less header"));
        }
        Ok(hd)
    }
}

fn cmp_name(a: &str, b: &str) -> std::cmp::Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archive;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn test_archive() -> (tempfile::TempDir, Archive) {
        crate::archive::test_archive(&[])
    }

    #[test]
    fn id_slot_starts_as_underscores() {
        let (_t, aa) = test_archive();
        let hd = Header::new(&aa);
        assert_eq!(hd.get_id(), "_".repeat(32));
    }

    #[test]
    fn fields_sorted_case_insensitively() {
        let (_t, aa) = test_archive();
        let mut hd = Header::new(&aa);
        hd.set("z", "pad");
        hd.set("Content-Type", "text/plain");
        hd.set("WARC-Type", "resource");
        hd.set("Content-Length", "17");
        let text = hd.serialize(-1).unwrap();
        let text = String::from_utf8(text).unwrap();
        let pos = |s: &str| text.find(s).unwrap();
        assert!(pos("Content-Length") < pos("Content-Type"));
        assert!(pos("Content-Type") < pos("WARC-Type"));
        assert!(pos("WARC-Type") < pos("\r\nz: "));
    }

    #[test]
    fn set_replaces_in_place() {
        let (_t, aa) = test_archive();
        let mut hd = Header::new(&aa);
        hd.set("Content-Length", "1");
        hd.set("content-length", "2");
        assert_eq!(hd.get("Content-Length"), Some("2"));
        assert_eq!(hd.get_number("Content-Length"), 2);
    }

    #[test]
    fn numbers() {
        let (_t, aa) = test_archive();
        let mut hd = Header::new(&aa);
        assert_eq!(hd.get_number("Content-Length"), -1);
        hd.set("Content-Length", "0012");
        assert_eq!(hd.get_number("Content-Length"), 12);
        hd.set("Content-Length", "x12");
        assert_eq!(hd.get_number("Content-Length"), -1);
        // A digit run past i128 is corruption, not a number.
        hd.set("Content-Length", "9".repeat(50));
        assert_eq!(hd.get_number("Content-Length"), -1);
        hd.set("Content-Length", i128::MAX);
        assert_eq!(hd.get_number("Content-Length"), i128::MAX);
    }

    #[test]
    fn roundtrip_through_gzip_member() {
        let (_t, aa) = test_archive();
        let mut hd = Header::new(&aa);
        hd.set("WARC-Type", "resource");
        hd.set("Content-Type", "application/octet-stream");
        hd.set("Content-Length", "1024");
        hd.set_id(&"ab".repeat(32));
        let member = hd.serialize(9).unwrap();
        let (text, _) = crate::gzip::decode_member(&member).unwrap();
        let hd2 = Header::parse(&aa, &text).unwrap();
        assert_eq!(hd2.get_id(), hd.get_id());
        assert_eq!(hd2.get("Content-Type"), hd.get("Content-Type"));
        assert_eq!(hd2.get_number("Content-Length"), 1024);
    }

    #[test]
    fn parse_rejects_foreign_dialects() {
        let (_t, aa) = test_archive();
        for text in [
            &b"WARC/1.0\r\nWARC-Record-ID: <x/00>\r\n\r\n"[..],
            &b"WARC/1.1\r\nContent-Length: 4\r\n\r\n"[..],
            &b"WARC/1.1\r\nWARC-Record-ID: <other:/aaaabbbbccccddddaaaabbbbccccdddd>\r\n\r\n"[..],
            &b"WARC/1.1\r\nWARC-Record-ID: <"[..],
        ] {
            assert!(Header::parse(&aa, text).is_err());
        }
    }

    #[test]
    fn field_len_matches_serialization() {
        let (_t, aa) = test_archive();
        let mut hd = Header::new(&aa);
        hd.set("WARC-Type", "resource");
        let before = hd.serialize(-1).unwrap().len();
        hd.set("WARC-Segment-Number", "1");
        let after = hd.serialize(-1).unwrap().len();
        assert_eq!(after - before, field_len("WARC-Segment-Number", "1"));
    }

    proptest! {
        #[test]
        fn serialize_parse_roundtrip(
            entries in proptest::collection::btree_map(
                "[A-Za-z][A-Za-z0-9-]{0,20}",
                "[ -~]{0,40}",
                0..8,
            ),
            id in "[0-9a-f]{64}",
        ) {
            let (_t, aa) = test_archive();
            let mut hd = Header::new(&aa);
            // De-duplicate case-insensitively; `set` replaces otherwise.
            let mut uniq = BTreeMap::new();
            for (k, v) in entries {
                uniq.insert(k.to_ascii_lowercase(), (k, v));
            }
            for (k, v) in uniq.values() {
                if k.eq_ignore_ascii_case("WARC-Record-ID") {
                    continue;
                }
                let v = v.trim();
                hd.set(k, v);
            }
            hd.set_id(&id);
            let text = hd.serialize(-1).unwrap();
            let hd2 = Header::parse(&aa, &text).unwrap();
            prop_assert_eq!(hd2.serialize(-1).unwrap(), text);
        }
    }
}
