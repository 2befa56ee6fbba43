//! The lookup index: truncated record ids → (silo, offset).
//!
//! # Files
//!
//! - `index.appendix` — append-only log of raw 32-byte entries, written by
//!   every insert (`O_APPEND`; unsorted, duplicates allowed).
//! - `index.sorted` — the merged, sorted file with a bucket table for
//!   interpolation seeks.
//! - `index.housekeep` — snapshot of the appendix taken at the start of a
//!   merge (`link` + `unlink`, so concurrent inserts start a fresh
//!   appendix that the *next* merge picks up).
//! - `index.hold` — whole-archive exclusion lock for the merge.
//!
//! Lookups search sorted, appendix, housekeep — in that order.
//!
//! # Entry layout (32 bytes, big-endian fields)
//!
//! ```text
//! Offset  Size  Field
//!    0     12   First 96 bits of the record id
//!   12      4   Flags (type nibble + segmentation nibble)
//!   16      4   Silo number
//!   20      8   Byte offset of the record's first gzip-ID1 in the silo
//!   28      4   First 16 bits of the next-segment id, or zero
//! ```
//!
//! # Sorted-file interpolation
//!
//! SHA-256 output is uniform, so reading an entry's first 64 bits as a
//! binary fraction in [0,1) — its *sha-fraction* — predicts its position
//! in the sorted file: `frac * nrec`, computed as 24 bits of fraction
//! times a 40-bit record count.  The residual between prediction and
//! reality is an accumulated random walk; a table of `2^bbucket` signed
//! per-bucket minima of that residual, built during the merge, lets a
//! lookup seek at (or slightly before) the target and read just a handful
//! of sequential records.  The 8-byte file header packs
//! `INDEX_ID << 48 | bbucket << 40 | nrec` and doubles as bucket 0's slot.
//! `bbucket` aims at one bucket per ~4096 records.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ByteOrder};
use log::{info, warn};

use crate::archive::Archive;
use crate::error::{Error, Result};

pub const REC_SIZE: usize = 32;
const KEYSUMM: usize = 12;
const INDEX_ID: u64 = 0x4161;

const SUFF_SORTED: &str = "sorted";
const SUFF_APPENDIX: &str = "appendix";
const SUFF_HOUSEKEEP: &str = "housekeep";
const SUFF_HOLD: &str = "hold";

// Bottom nibble: record type (0 = continuation segment).
pub const F_WARCINFO: u32 = 1 << 1;
pub const F_RESOURCE: u32 = 1 << 2;
pub const F_METADATA: u32 = 1 << 3;

// Next nibble: segmentation.
pub const F_SEGMENTED: u32 = 1 << 4;
pub const F_FIRSTSEG: u32 = 1 << 5;
pub const F_LASTSEG: u32 = 1 << 6;

/// One decoded index entry.  `key` is the 24-hex-char truncated id,
/// `cont` the 8-hex-char hint locating the next segment (zeros if none).
#[derive(Debug, Clone)]
pub struct Entry {
    pub key:    String,
    pub flags:  u32,
    pub silo:   u32,
    pub offset: u64,
    pub cont:   String,
}

impl Entry {
    pub fn is(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

fn filename(aa: &Archive, suffix: &str) -> PathBuf {
    aa.silo_dirname().join(format!("index.{suffix}"))
}

// ── Key handling ─────────────────────────────────────────────────────────────

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(10 + c - b'a'),
        b'A'..=b'F' => Ok(10 + c - b'A'),
        _ => Err(Error::IdInvalid(format!(
            "non-hex character {:?} in record id",
            c as char
        ))),
    }
}

/// Pack a hex key prefix into `dst`, zero-padding on the right.
fn key_bin(dst: &mut [u8], key: &str) -> Result<()> {
    let mut nibbles = key.bytes();
    for d in dst.iter_mut() {
        *d = 0;
        if let Some(c) = nibbles.next() {
            *d |= hex_digit(c)? << 4;
        }
        if let Some(c) = nibbles.next() {
            *d |= hex_digit(c)?;
        }
    }
    Ok(())
}

/// Check an id: optional archive prefix, then exactly `id_size` hex
/// characters.  Returns the normalized (stripped, lowercased) digest.
pub fn valid_id(aa: &Archive, id: &str) -> Result<String> {
    let mut id = id;
    let plen = aa.prefix().len();
    if id.len() >= plen && id[..plen].eq_ignore_ascii_case(aa.prefix()) {
        id = &id[plen..];
    }
    if id.contains([':', '/']) {
        return Err(Error::IdInvalid("wrong prefix?".to_owned()));
    }
    if !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::IdInvalid("non-hex characters".to_owned()));
    }
    if id.len() < aa.id_size() {
        return Err(Error::IdInvalid("too short".to_owned()));
    }
    if id.len() > aa.id_size() {
        return Err(Error::IdInvalid("too long".to_owned()));
    }
    Ok(id.to_ascii_lowercase())
}

// ── Insert ───────────────────────────────────────────────────────────────────

/// Append one entry to `index.appendix`.  A single 32-byte `O_APPEND`
/// write, atomic with respect to concurrent inserters on local
/// filesystems.
pub fn insert(
    aa: &Archive,
    key: &str,
    flags: u32,
    silo: u32,
    offset: u64,
    cont: Option<&str>,
) -> Result<()> {
    assert!(aa.id_size() >= 16);

    let mut rec = [0u8; REC_SIZE];
    key_bin(&mut rec[0..KEYSUMM], key)?;
    BigEndian::write_u32(&mut rec[12..16], flags);
    BigEndian::write_u32(&mut rec[16..20], silo);
    BigEndian::write_u64(&mut rec[20..28], offset);
    if let Some(c) = cont {
        key_bin(&mut rec[28..32], c)?;
    }

    let mut f = OpenOptions::new()
        .append(true)
        .create(true)
        .open(filename(aa, SUFF_APPENDIX))?;
    f.write_all(&rec)?;
    Ok(())
}

// ── Iterate / lookup ─────────────────────────────────────────────────────────

fn read_rec(r: &mut impl Read) -> Result<Option<[u8; REC_SIZE]>> {
    let mut rec = [0u8; REC_SIZE];
    match r.read_exact(&mut rec) {
        Ok(()) => Ok(Some(rec)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_sorted_header(r: &mut (impl Read + Seek)) -> Result<(u32, u64)> {
    r.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    let id = BigEndian::read_u64(&buf);
    let bb = ((id >> 40) & 0xff) as u32;
    if id >> 48 != INDEX_ID || !(2..=52).contains(&bb) {
        return Err(Error::BadFormat("index.sorted header corrupt".to_owned()));
    }
    Ok((bb, id & 0xff_ffff_ffff))
}

/// Interpolation seek: position the reader at (or conservatively before)
/// the first record that could match `key_p`.
fn sorted_seek(r: &mut BufReader<File>, key_p: &[u8; KEYSUMM]) -> Result<()> {
    let (bb, nrec) = read_sorted_header(r)?;
    let table_end = 8u64 << bb;

    let frac = BigEndian::read_u64(&key_p[0..8]);
    let bucket = frac >> (64 - bb);
    if bucket == 0 {
        r.seek(SeekFrom::Start(table_end))?;
        return Ok(());
    }

    r.seek(SeekFrom::Start(bucket * 8))?;
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    let residual = BigEndian::read_u64(&buf) as i64;

    let pred = (((frac >> 40) as u128 * nrec as u128) >> 24) as i64;
    let pos = pred + residual;
    let byte = if pos <= 0 {
        table_end
    } else {
        // The residual is a per-bucket minimum, so this lands at or before
        // the target; never inside the bucket table.
        (pos as u64 * REC_SIZE as u64).max(table_end)
    };
    r.seek(SeekFrom::Start(byte))?;
    Ok(())
}

/// Visit every entry whose key starts with `key_part` (all entries when
/// `None`), across sorted, appendix and housekeep.  The callback returns
/// `true` to stop; `iter` reports whether it was stopped.
///
/// The truncated keys make collisions possible in principle, so lookups
/// must be prepared to see — and reject — more than one candidate.
pub fn iter(
    aa: &Archive,
    key_part: Option<&str>,
    f: &mut dyn FnMut(&Entry) -> Result<bool>,
) -> Result<bool> {
    let mut key_p = [0u8; KEYSUMM];
    let cl = match key_part {
        Some(k) => {
            key_bin(&mut key_p, k)?;
            k.len().min(KEYSUMM * 2)
        }
        None => 0,
    };

    for (suff, is_sorted) in [
        (SUFF_SORTED, true),
        (SUFF_APPENDIX, false),
        (SUFF_HOUSEKEEP, false),
    ] {
        let file = match File::open(filename(aa, suff)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let mut r = BufReader::new(file);
        if is_sorted {
            sorted_seek(&mut r, &key_p)?;
        }
        while let Some(rec) = read_rec(&mut r)? {
            if cl >= 2 {
                let cmp = rec[..cl / 2].cmp(&key_p[..cl / 2]);
                if is_sorted && cmp == std::cmp::Ordering::Greater {
                    break;
                }
                if cmp != std::cmp::Ordering::Equal {
                    continue;
                }
            }
            let key = format!(
                "{:016x}{:08x}",
                BigEndian::read_u64(&rec[0..8]),
                BigEndian::read_u32(&rec[8..12]),
            );
            if let Some(kp) = key_part {
                if !key[..cl].eq_ignore_ascii_case(&kp[..cl]) {
                    continue;
                }
            }
            let entry = Entry {
                key,
                flags: BigEndian::read_u32(&rec[12..16]),
                silo: BigEndian::read_u32(&rec[16..20]),
                offset: BigEndian::read_u64(&rec[20..28]),
                cont: format!("{:08x}", BigEndian::read_u32(&rec[28..32])),
            };
            if f(&entry)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

// ── Resort ───────────────────────────────────────────────────────────────────

struct Bucket {
    bb:      u32,
    nrec:    u64,
    buckets: Vec<i64>,
}

impl Bucket {
    fn new(nrec_estimate: u64) -> Result<Bucket> {
        if nrec_estimate >> 40 != 0 {
            return Err(Error::BadFormat("index beyond 2^40 records".to_owned()));
        }
        // Start from four buckets so the table aligns with the record
        // size; one bucket per ~4096 records beyond that.
        let mut bb = 14u32;
        while (1u64 << bb) < nrec_estimate {
            bb += 1;
        }
        bb -= 12;
        Ok(Bucket {
            bb,
            nrec: nrec_estimate,
            buckets: vec![0i64; 1usize << bb],
        })
    }

    fn predict(&self, rec: &[u8; REC_SIZE]) -> (usize, i64) {
        let u = BigEndian::read_u64(&rec[0..8]);
        let b = (u >> (64 - self.bb)) as usize;
        let pred = (((u >> 40) as u128 * self.nrec as u128) >> 24) as i64;
        (b, pred)
    }

    /// Record `rec` landed at position `n`; keep the bucket residual at
    /// its minimum so seeks always land at or before their target.
    fn update(&mut self, n: i64, rec: &[u8; REC_SIZE]) {
        let (b, pred) = self.predict(rec);
        if b > 0 && pred + self.buckets[b] > n {
            self.buckets[b] = n - pred;
        }
    }

    fn table(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.buckets.len() * 8];
        let head = ((INDEX_ID as i64) << 48) | ((self.bb as i64) << 40) | self.nrec as i64;
        BigEndian::write_i64(&mut out[0..8], head);
        for (i, b) in self.buckets.iter().enumerate().skip(1) {
            BigEndian::write_i64(&mut out[i * 8..i * 8 + 8], *b);
        }
        out
    }
}

struct MergeOut {
    w:      BufWriter<File>,
    bucket: Bucket,
    n:      i64,
    last:   Option<[u8; REC_SIZE]>,
}

impl MergeOut {
    /// Write one record unless it exactly duplicates the previous one.
    fn push(&mut self, rec: &[u8; REC_SIZE]) -> Result<()> {
        if self.last.as_ref() == Some(rec) {
            return Ok(());
        }
        self.bucket.update(self.n, rec);
        self.w.write_all(rec)?;
        self.n += 1;
        self.last = Some(*rec);
        Ok(())
    }
}

/// Merge one sorted chunk of fresh records with the existing sorted file
/// into a new one, rebuilding the bucket table, then rename it over.
fn merge_chunk(aa: &Archive, chunk: &[[u8; REC_SIZE]]) -> Result<()> {
    let sorted_fn = filename(aa, SUFF_SORTED);
    let tmp_fn = filename(aa, &format!("tmp.{}", std::process::id()));

    let mut old = None;
    let mut old_nrec = 0u64;
    match File::open(&sorted_fn) {
        Ok(f) => {
            let mut r = BufReader::new(f);
            let (bb, _) = read_sorted_header(&mut r)?;
            let table_end = 8u64 << bb;
            let len = r.get_ref().metadata()?.len();
            old_nrec = len.saturating_sub(table_end) / REC_SIZE as u64;
            r.seek(SeekFrom::Start(table_end))?;
            old = Some(r);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let bucket = Bucket::new(old_nrec + chunk.len() as u64)?;
    let mut out = MergeOut {
        w: BufWriter::new(File::create(&tmp_fn)?),
        bucket,
        n: 0,
        last: None,
    };
    out.w.write_all(&out.bucket.table())?;

    let mut ci = 0usize;
    if let Some(mut r) = old {
        let mut prev: Option<[u8; REC_SIZE]> = None;
        while let Some(rec) = read_rec(&mut r)? {
            if prev.map_or(false, |p| rec < p) {
                return Err(Error::IntegrityMismatch(
                    "index.sorted is not sorted".to_owned(),
                ));
            }
            prev = Some(rec);
            while ci < chunk.len() && chunk[ci] < rec {
                out.push(&chunk[ci])?;
                ci += 1;
            }
            while ci < chunk.len() && chunk[ci] == rec {
                ci += 1;
            }
            out.push(&rec)?;
        }
    }
    while ci < chunk.len() {
        out.push(&chunk[ci])?;
        ci += 1;
    }

    // Rewrite the table now that the residuals are known.
    let table = out.bucket.table();
    out.w.flush()?;
    let mut f = out.w.into_inner().map_err(|e| e.into_error())?;
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&table)?;
    fs::rename(&tmp_fn, &sorted_fn)?;
    Ok(())
}

/// Sort and merge `index.housekeep` into `index.sorted`, one
/// `index.sort_size` chunk at a time, then remove the snapshot.
fn merge_housekeep(aa: &Archive) -> Result<()> {
    let hk_fn = filename(aa, SUFF_HOUSEKEEP);
    let mut f = File::open(&hk_fn)?;
    let chunk_size = aa.index_sort_size() as usize;
    let mut space = vec![0u8; chunk_size];
    loop {
        let mut got = 0usize;
        while got < chunk_size {
            let n = f.read(&mut space[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            break;
        }
        if got % REC_SIZE != 0 {
            warn!("index.housekeep has a torn record; dropping the tail");
            got -= got % REC_SIZE;
        }
        let mut recs: Vec<[u8; REC_SIZE]> = space[..got]
            .chunks_exact(REC_SIZE)
            .map(|c| c.try_into().unwrap())
            .collect();
        recs.sort_unstable();
        merge_chunk(aa, &recs)?;
        if got < chunk_size {
            break;
        }
    }
    fs::remove_file(&hk_fn)?;
    Ok(())
}

/// Fold the appendix into the sorted file.
///
/// Takes `index.hold` exclusively (failing with [`Error::Lock`] if another
/// merge is running), snapshots the appendix to `index.housekeep` by
/// `link` + `unlink` — concurrent inserters immediately begin a fresh
/// appendix — and merges.  A housekeep snapshot left behind by a crashed
/// run is merged first.
pub fn resort(aa: &Archive) -> Result<()> {
    let hold_fn = filename(aa, SUFF_HOLD);
    match OpenOptions::new().write(true).create_new(true).open(&hold_fn) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(Error::Lock(hold_fn.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    }
    let r = resort_locked(aa);
    if let Err(e) = fs::remove_file(&hold_fn) {
        warn!("cannot remove {}: {e}", hold_fn.display());
    }
    r
}

fn resort_locked(aa: &Archive) -> Result<()> {
    let app_fn = filename(aa, SUFF_APPENDIX);
    let hk_fn = filename(aa, SUFF_HOUSEKEEP);
    loop {
        match fs::hard_link(&app_fn, &hk_fn) {
            Ok(()) => {
                fs::remove_file(&app_fn)?;
                merge_housekeep(aa)?;
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                info!("merging housekeeping snapshot left by an earlier run");
                merge_housekeep(aa)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if hk_fn.exists() {
                    merge_housekeep(aa)?;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_archive;
    use sha2::{Digest, Sha256};

    fn key_of(i: u32) -> String {
        hex::encode(Sha256::digest(i.to_string().as_bytes()))[..32].to_owned()
    }

    fn collect(aa: &Archive, part: Option<&str>) -> Vec<Entry> {
        let mut out = Vec::new();
        iter(aa, part, &mut |e| {
            out.push(e.clone());
            Ok(false)
        })
        .unwrap();
        out
    }

    #[test]
    fn key_packing() {
        let mut dst = [0u8; 12];
        key_bin(&mut dst, "DEADbeef01").unwrap();
        assert_eq!(dst[..5], [0xde, 0xad, 0xbe, 0xef, 0x01]);
        assert_eq!(dst[5..], [0u8; 7]);
        assert!(key_bin(&mut dst, "xyz").is_err());
    }

    #[test]
    fn insert_and_find_in_appendix() {
        let (_t, aa) = test_archive(&[]);
        let k1 = key_of(1);
        let k2 = key_of(2);
        insert(&aa, &k1, F_RESOURCE, 3, 4096, None).unwrap();
        insert(&aa, &k2, F_METADATA | F_SEGMENTED, 5, 8192, Some(&k1[..8])).unwrap();

        let hits = collect(&aa, Some(&k1));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, k1[..24]);
        assert_eq!(hits[0].silo, 3);
        assert_eq!(hits[0].offset, 4096);
        assert!(hits[0].is(F_RESOURCE));
        assert_eq!(hits[0].cont, "00000000");

        let hits = collect(&aa, Some(&k2[..10]));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].cont, k1[..8]);

        assert_eq!(collect(&aa, None).len(), 2);
    }

    #[test]
    fn iteration_stops_when_asked() {
        let (_t, aa) = test_archive(&[]);
        for i in 0..10 {
            insert(&aa, &key_of(i), F_RESOURCE, i, 0, None).unwrap();
        }
        let mut seen = 0;
        let stopped = iter(&aa, None, &mut |_| {
            seen += 1;
            Ok(seen == 3)
        })
        .unwrap();
        assert!(stopped);
        assert_eq!(seen, 3);
    }

    #[test]
    fn resort_sorts_and_dedups() {
        let (_t, aa) = test_archive(&[]);
        for i in 0..500u32 {
            insert(&aa, &key_of(i), F_RESOURCE, i, u64::from(i) * 64, None).unwrap();
        }
        // Exact duplicates collapse; same key at a new location does not.
        insert(&aa, &key_of(7), F_RESOURCE, 7, 7 * 64, None).unwrap();
        insert(&aa, &key_of(8), F_RESOURCE, 99, 1234, None).unwrap();
        resort(&aa).unwrap();

        assert!(!filename(&aa, SUFF_APPENDIX).exists());
        assert!(!filename(&aa, SUFF_HOUSEKEEP).exists());
        assert!(!filename(&aa, SUFF_HOLD).exists());

        let all = collect(&aa, None);
        assert_eq!(all.len(), 501);
        let keys: Vec<_> = all.iter().map(|e| e.key.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "sorted file must come out in key order");
        sorted.dedup();
        assert_eq!(sorted.len(), 500, "only the re-stored key may repeat");

        for i in 0..500u32 {
            let hits = collect(&aa, Some(&key_of(i)));
            let want = if i == 8 { 2 } else { 1 };
            assert_eq!(hits.len(), want, "key {i}");
        }
    }

    #[test]
    fn resort_merges_appendix_written_after_previous_merge() {
        let (_t, aa) = test_archive(&[]);
        for i in 0..100u32 {
            insert(&aa, &key_of(i), F_RESOURCE, i, 0, None).unwrap();
        }
        resort(&aa).unwrap();
        for i in 100..200u32 {
            insert(&aa, &key_of(i), F_RESOURCE, i, 0, None).unwrap();
        }
        resort(&aa).unwrap();
        assert_eq!(collect(&aa, None).len(), 200);
        for i in (0..200u32).step_by(17) {
            assert_eq!(collect(&aa, Some(&key_of(i))).len(), 1, "key {i}");
        }
    }

    #[test]
    fn crashed_snapshot_is_merged_first() {
        let (_t, aa) = test_archive(&[]);
        for i in 0..10u32 {
            insert(&aa, &key_of(i), F_RESOURCE, i, 0, None).unwrap();
        }
        // Simulate a merge that died after the snapshot.
        fs::hard_link(filename(&aa, SUFF_APPENDIX), filename(&aa, SUFF_HOUSEKEEP)).unwrap();
        fs::remove_file(filename(&aa, SUFF_APPENDIX)).unwrap();
        for i in 10..20u32 {
            insert(&aa, &key_of(i), F_RESOURCE, i, 0, None).unwrap();
        }
        resort(&aa).unwrap();
        assert_eq!(collect(&aa, None).len(), 20);
    }

    #[test]
    fn resort_respects_hold() {
        let (_t, aa) = test_archive(&[]);
        insert(&aa, &key_of(0), F_RESOURCE, 0, 0, None).unwrap();
        File::create(filename(&aa, SUFF_HOLD)).unwrap();
        assert!(matches!(resort(&aa), Err(Error::Lock(_))));
        fs::remove_file(filename(&aa, SUFF_HOLD)).unwrap();
        resort(&aa).unwrap();
    }

    #[test]
    fn valid_ids() {
        let (_t, aa) = test_archive(&[]);
        let id = "0123456789abcdef0123456789ABCDEF";
        assert_eq!(valid_id(&aa, id).unwrap(), id.to_ascii_lowercase());
        let with_prefix = format!("{}{}", aa.prefix(), id);
        assert_eq!(valid_id(&aa, &with_prefix).unwrap(), id.to_ascii_lowercase());
        assert!(valid_id(&aa, &id[..30]).is_err());
        assert!(valid_id(&aa, &format!("{id}aa")).is_err());
        assert!(valid_id(&aa, "g123456789abcdef0123456789abcdef").is_err());
        assert!(valid_id(&aa, "http://other/0123456789abcdef0123456789abcdef").is_err());
    }
}
