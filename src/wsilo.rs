//! Silo writer.
//!
//! A writer claims a silo number by creating `<silo>.hold` with
//! `O_CREAT|O_EXCL`, streams the record into the hold file, and publishes
//! it on commit with `link(hold, silo)` — link, not rename, so a silo that
//! appeared behind our back makes the commit fail instead of clobbering.
//! Concurrent writers racing for a number simply lose the hold creation
//! and move on to the next.
//!
//! # Space reservation
//!
//! The first record's header cannot be serialized finally until the body
//! has been written (lengths, digests and segment linkage are only known
//! then), so [`Wsilo::header`] reserves `serialized + pad` bytes up front.
//! On commit the reservation is filled *exactly*: a synthetic `z:` field
//! padded with underscores makes the final serialized header the same
//! size as the reservation.
//!
//! # Append optimization
//!
//! Unsegmented records whose silo turned out small are appended into the
//! first earlier silo with room instead (bounded scan from the
//! `first_space_silo` hint), under that silo's own `.hold`.  The scan
//! stops at the first silo carrying a `.seal` sidecar — permanent silos
//! are sealed bottom-up.  Segmented records always keep their own silo.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use memmap2::Mmap;

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::gzip;
use crate::header::{field_len, Header};
use crate::index;
use crate::silo;
use crate::warcinfo;

const PADDING_HEADER: &str = "z";
const STALE_HOLD: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct Wsilo<'a> {
    aa:       &'a Archive,
    silo_no:  u32,
    silo_fn:  PathBuf,
    hold_fn:  PathBuf,
    file:     File,
    hold_len: u64,

    hd_reserved: bool,
    hd_start:    u64,
    hd_len:      usize,
    idx_flags:   u32,

    warcinfo_id: String,
    finished:    bool,
}

/// Removes a candidate silo's `.hold` when the append attempt ends.
struct HoldGuard(PathBuf);

impl Drop for HoldGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            warn!("cannot remove {}: {e}", self.0.display());
        }
    }
}

impl<'a> Wsilo<'a> {
    /// Claim the lowest free silo number at or above the `first_non_silo`
    /// hint and write the warcinfo record as record #0.
    pub fn new(aa: &'a Archive) -> Result<Wsilo<'a>> {
        aa.read_cache();
        let mut silo_no = aa.first_non_silo();
        let (file, silo_fn, hold_fn) = loop {
            let silo_fn = silo::filename(aa, silo_no);
            if silo_fn.exists() {
                silo_no += 1;
                continue;
            }
            if let Some(parent) = silo_fn.parent() {
                fs::create_dir_all(parent)?;
            }
            let hold_fn = silo::hold_filename(aa, silo_no);
            if let Ok(meta) = fs::metadata(&hold_fn) {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .unwrap_or(Duration::ZERO);
                if age <= STALE_HOLD {
                    // A live writer holds this number.
                    silo_no += 1;
                    continue;
                }
                warn!("removing stale hold {}", hold_fn.display());
                let _ = fs::remove_file(&hold_fn);
            }
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&hold_fn)
            {
                Ok(f) => break (f, silo_fn, hold_fn),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    silo_no += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };
        debug!("new silo {} held at {}", silo_no, hold_fn.display());

        let mut sl = Wsilo {
            aa,
            silo_no,
            silo_fn,
            hold_fn,
            file,
            hold_len: 0,
            hd_reserved: false,
            hd_start: 0,
            hd_len: 0,
            idx_flags: 0,
            warcinfo_id: String::new(),
            finished: false,
        };
        sl.warcinfo_id = warcinfo::emit(aa, &mut sl, silo_no)?;
        Ok(sl)
    }

    pub fn silo_no(&self) -> u32 {
        self.silo_no
    }

    pub fn hold_len(&self) -> u64 {
        self.hold_len
    }

    /// Bytes still writable before the silo cap.
    pub fn remaining(&self) -> u64 {
        self.aa.silo_max_size() - self.hold_len
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Append bytes to the hold file.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.hold_len + bytes.len() as u64 > self.aa.silo_max_size() {
            return Err(Error::SiloFull);
        }
        self.file.write_all(bytes)?;
        self.hold_len += bytes.len() as u64;
        Ok(())
    }

    /// Reserve space for the object's header: the provisional serialized
    /// form plus `pad` bytes (plus the padding field's own framing),
    /// filled with underscores until commit.
    pub fn header(&mut self, hd: &Header, pad: usize) -> Result<()> {
        assert!(!self.hd_reserved, "header space already reserved");
        let pad = if pad > 0 {
            pad + field_len(PADDING_HEADER, "_")
        } else {
            0
        };

        match hd.get("WARC-Type") {
            Some("metadata") => self.idx_flags |= index::F_METADATA,
            Some("resource") => self.idx_flags |= index::F_RESOURCE,
            _ => {}
        }

        let v2 = hd.serialize(0)?;
        self.hd_reserved = true;
        self.hd_start = self.hold_len;
        self.hd_len = v2.len() + pad;
        self.write(&v2)?;
        self.write(&vec![b'_'; pad])?;
        Ok(())
    }

    /// Patch an Aa length at an absolute hold-file offset (the streaming
    /// writer fixes up its body member once the segment is closed).
    pub fn patch_aa(&self, offset: u64, len: u64) -> Result<()> {
        gzip::patch_aa_at(&self.file, offset, len)
    }

    /// No more body bytes will be written.
    pub fn finish(&mut self) {
        assert!(!self.finished);
        self.finished = true;
    }

    // ── Commit ───────────────────────────────────────────────────────────────

    /// Serialize the final header so it fills the reservation exactly.
    fn padded_header(&self, hd: &Header) -> Result<Vec<u8>> {
        let v2 = hd.serialize(0)?;
        let mut needed = self.hd_len.checked_sub(v2.len()).ok_or_else(|| {
            Error::BadFormat("final header exceeds reserved space".to_owned())
        })?;
        if needed == 0 {
            return Ok(v2);
        }
        let base = field_len(PADDING_HEADER, "");
        if needed < base {
            return Err(Error::BadFormat(
                "reserved header space cannot be padded exactly".to_owned(),
            ));
        }
        let mut hd = hd.clone();
        // The serialized size tracks the padding width one-for-one, but
        // iterate in case the framing ever rounds a block boundary.
        for _ in 0..8 {
            hd.set(PADDING_HEADER, "_".repeat(needed - base));
            let v2 = hd.serialize(0)?;
            match self.hd_len as i64 - v2.len() as i64 {
                0 => return Ok(v2),
                diff => {
                    needed = (needed as i64 + diff).try_into().map_err(|_| {
                        Error::BadFormat("header padding does not converge".to_owned())
                    })?;
                }
            }
        }
        Err(Error::BadFormat("header padding does not converge".to_owned()))
    }

    /// Publish the record.  `hd` is the final header; `rid` the id of the
    /// following segment, if any.
    pub fn commit(self, hd: &Header, segmented: bool, id: &str, rid: Option<&str>) -> Result<()> {
        assert!(self.finished, "commit before finish");
        assert!(self.hd_reserved, "commit without a header");
        let aa = self.aa;

        if !segmented && self.silo_no > 0 {
            assert!(rid.is_none());
            // Try to drop the record into an earlier silo with room.
            let v2 = hd.serialize(9)?;
            for sn in aa.first_space_silo()..self.silo_no {
                match self.attempt_append(sn, &v2, id)? {
                    Append::Done => return Ok(()),
                    Append::Stop => break,
                    Append::Next => {}
                }
            }
        }

        // Own silo: fill the header reservation and link the hold in.
        let mut v2 = self.padded_header(hd)?;
        gzip::patch_aa(&mut v2, self.hold_len - self.hd_start);
        self.file.write_all_at(&v2, self.hd_start)?;

        index::insert(aa, &self.warcinfo_id, index::F_WARCINFO, self.silo_no, 0, None)?;
        let mut flags = self.idx_flags;
        if segmented {
            flags |= index::F_SEGMENTED;
            if hd.get("WARC-Segment-Number") == Some("1") {
                flags |= index::F_FIRSTSEG;
            }
            if rid.is_none() {
                flags |= index::F_LASTSEG;
            }
        }
        index::insert(aa, id, flags, self.silo_no, self.hd_start, rid)?;

        fs::hard_link(&self.hold_fn, &self.silo_fn)?;
        if self.silo_no == aa.first_non_silo() {
            aa.bump_first_non_silo();
        }
        debug!("committed record {} to silo {}", id, self.silo_no);
        Ok(())
    }

    /// Try to append this record to existing silo `sn`.
    fn attempt_append(&self, sn: u32, v2: &[u8], id: &str) -> Result<Append> {
        let aa = self.aa;
        let fn_ = silo::filename(aa, sn);
        let meta = match fs::metadata(&fn_) {
            Ok(m) if m.is_file() => m,
            _ => return Ok(Append::Next),
        };
        if sn == aa.first_non_silo() {
            aa.bump_first_non_silo();
        }
        if silo::seal_filename(aa, sn).exists() {
            // Permanently archived silos are sealed bottom-up; stop the
            // scan at the first one.
            return Ok(Append::Stop);
        }

        // Autotune how full silos are packed against how many the scan
        // has to examine.
        let ax = aa.silo_max_size().saturating_sub(meta.len());
        let bx = u64::from(aa.first_non_silo() - aa.first_space_silo());
        if sn == aa.first_space_silo() && ax < bx {
            aa.bump_first_space_silo();
        }

        let body_start = self.hd_start + self.hd_len as u64;
        let need = v2.len() as u64 + (self.hold_len - body_start);
        if meta.len() + need > aa.silo_max_size() {
            return Ok(Append::Next);
        }

        let hold_fn = silo::hold_filename(aa, sn);
        let _guard = match OpenOptions::new().write(true).create_new(true).open(&hold_fn) {
            Ok(_) => HoldGuard(hold_fn),
            Err(_) => return Ok(Append::Next),
        };

        let mut dst = match OpenOptions::new().append(true).open(&fn_) {
            Ok(f) => f,
            Err(_) => return Ok(Append::Next),
        };
        let meta = dst.metadata()?;
        if !meta.is_file() || meta.len() + need > aa.silo_max_size() {
            return Ok(Append::Next);
        }
        let offset = meta.len();

        // The record-level Aa spans the re-serialized header through the
        // crnlcrnl already in the hold file.
        let mut v2 = v2.to_vec();
        gzip::patch_aa(&mut v2, need);

        let map = unsafe { Mmap::map(&self.file)? };
        let body = &map[body_start as usize..self.hold_len as usize];
        dst.write_all(&v2)?;
        dst.write_all(body)?;

        index::insert(aa, id, self.idx_flags, sn, offset, None)?;
        debug!("appended record {id} to silo {sn} at {offset}");
        Ok(Append::Done)
    }
}

enum Append {
    Done,
    Next,
    Stop,
}

impl Drop for Wsilo<'_> {
    fn drop(&mut self) {
        // Committed or abandoned, the hold is ours to remove.
        if let Err(e) = fs::remove_file(&self.hold_fn) {
            warn!("cannot remove {}: {e}", self.hold_fn.display());
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
