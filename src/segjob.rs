//! The streaming segmenter: feed bytes, get one object in 1..N records.
//!
//! Bytes are compressed as they arrive and steered so every segment fits
//! its silo almost exactly:
//!
//! - with plenty of room, plain DEFLATE with input advance bounded to
//!   half the remaining output space (a Zeno guard, so the tail
//!   approaches the cap geometrically instead of overshooting it);
//! - under 128 KiB of room, every pass is partial-flushed so no large
//!   compressed lump can appear late;
//! - under 52 bytes of room — or when the caller flushes — the stream is
//!   sync-flushed to a byte boundary, closed with the stitchable stop
//!   block and trailer, and the segment is finalized.
//!
//! Headers are written before the body exists, so each segment reserves
//! padding for the fields only known at the end (`WARC-Segment-Number`
//! and `WARC-Payload-Digest` on segment 1, `WARC-Segment-Total-Length`
//! on later segments) and claims a provisional `Content-Length` of
//! `00<silo_max_size>` — the two extra digits cover even pathological
//! expansion.
//!
//! Committing an object whose id is already present abandons the fresh
//! segments and returns the existing canonical id: stores are idempotent.

use flate2::{Compress, Compression, FlushCompress};
use log::info;
use sha2::{Digest, Sha256};

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::getjob::GetJob;
use crate::gzip;
use crate::header::{field_len, Header};
use crate::ident;
use crate::index;
use crate::wsilo::Wsilo;

/// Below this much output room a segment is closed out.  40 is what the
/// close sequence can need; 52 leaves safety margin.
const CLOSE_SPACE: u64 = 52;

/// Below this much output room every deflate pass is partial-flushed.
const FLUSH_SPACE: u64 = 128 * 1024;

/// Output staging buffer bound.
const OBUF: usize = 1024 * 1024;

struct Segment<'a> {
    segno: u32,
    hd:    Header,
    silo:  Wsilo<'a>,
    size:  u64,
}

/// A segment still receiving bytes.
struct CurSeg<'a> {
    seg:        Segment<'a>,
    cz:         Compress,
    crc:        crc32fast::Hasher,
    sha:        Sha256,
    /// Hold-file offset of the body member's preamble.
    body_start: u64,
}

pub struct SegJob<'a> {
    aa:          &'a Archive,
    template:    Header,
    ident:       Option<String>,
    nseg:        u32,
    segments:    Vec<Segment<'a>>,
    cur:         Option<CurSeg<'a>>,
    sha_payload: Sha256,
    size:        u64,
}

impl<'a> SegJob<'a> {
    /// `template` must carry `WARC-Type`, `Content-Type` and `WARC-Date`,
    /// and none of the segmentation fields; those are this job's to set.
    pub fn new(aa: &'a Archive, template: &Header, ident: Option<&str>) -> Result<SegJob<'a>> {
        assert!(template.get("WARC-Type").is_some());
        assert!(template.get("Content-Type").is_some());
        assert!(template.get("WARC-Date").is_some());
        assert!(template.get("WARC-Segment-Number").is_none());
        assert!(template.get("WARC-Payload-Digest").is_none());
        assert!(template.get("WARC-Segment-Origin-ID").is_none());
        assert!(template.get("WARC-Segment-Total-Length").is_none());
        let ident = match ident {
            Some(i) => Some(index::valid_id(aa, i)?),
            None => None,
        };
        Ok(SegJob {
            aa,
            template: template.clone(),
            ident,
            nseg: 0,
            segments: Vec::new(),
            cur: None,
            sha_payload: Sha256::new(),
            size: 0,
        })
    }

    // ── Segment lifecycle ────────────────────────────────────────────────────

    fn new_segment(&mut self) -> Result<()> {
        assert!(self.cur.is_none());
        self.nseg += 1;
        let segno = self.nseg;
        let empty = hex::encode(Sha256::digest(b""));

        let mut hd = self.template.clone();
        hd.set("WARC-Block-Digest", format!("sha256:{empty}"));
        // Two extra digits of headroom for data that expands.
        hd.set("Content-Length", format!("00{}", self.aa.silo_max_size()));

        let mut pad = 0usize;
        if segno == 1 {
            pad += field_len("WARC-Segment-Number", "1");
            pad += field_len("WARC-Payload-Digest", &format!("sha256:{empty}"));
        } else {
            hd.set("WARC-Segment-Number", segno);
            hd.set("WARC-Type", "continuation");
            hd.set_ref("WARC-Segment-Origin-ID", &empty);
            // Should this become the last segment.
            let most = self.size + self.aa.silo_max_size();
            pad += field_len("WARC-Segment-Total-Length", &most.to_string());
        }

        let mut silo = Wsilo::new(self.aa)?;
        silo.header(&hd, pad)?;

        let body_start = silo.hold_len();
        let mut preamble = [0u8; gzip::AA_PREAMBLE];
        preamble[..gzip::GZIP_HEAD.len()].copy_from_slice(&gzip::GZIP_HEAD);
        silo.write(&preamble)?;

        self.cur = Some(CurSeg {
            seg: Segment {
                segno,
                hd,
                silo,
                size: 0,
            },
            cz: Compress::new(Compression::default(), false),
            crc: crc32fast::Hasher::new(),
            sha: Sha256::new(),
            body_start,
        });
        Ok(())
    }

    fn finish_segment(&mut self) -> Result<()> {
        let mut cur = self.cur.take().expect("no segment to finish");

        // Drain the compressor to a byte boundary.
        let mut out = vec![0u8; 64 * 1024];
        loop {
            let before = cur.cz.total_out();
            cur.cz
                .compress(&[], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::BadFormat(format!("deflate: {e}")))?;
            let produced = (cur.cz.total_out() - before) as usize;
            if produced > 0 {
                cur.seg.silo.write(&out[..produced])?;
            }
            if produced < out.len() {
                break;
            }
        }

        let crc = cur.crc.clone().finalize();
        cur.seg
            .silo
            .write(&gzip::member_close(crc, cur.seg.size as u32))?;
        cur.seg.silo.write(&gzip::GZIP_CRNLCRNL)?;

        let body_len =
            cur.seg.silo.hold_len() - gzip::GZIP_CRNLCRNL.len() as u64 - cur.body_start;
        cur.seg.silo.patch_aa(cur.body_start, body_len)?;

        let dig = hex::encode(cur.sha.finalize());
        cur.seg.hd.set("WARC-Block-Digest", format!("sha256:{dig}"));
        cur.seg.hd.set("Content-Length", cur.seg.size);
        let over = if cur.seg.segno == 1 {
            self.ident.as_deref()
        } else {
            None
        };
        ident::set(self.aa, &mut cur.seg.hd, &dig, over)?;
        cur.seg.silo.finish();
        self.segments.push(cur.seg);
        Ok(())
    }

    // ── Feeding ──────────────────────────────────────────────────────────────

    /// Stream bytes into the object.  An empty slice flushes and closes
    /// the current segment.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<()> {
        if input.is_empty() {
            if self.cur.is_some() {
                self.finish_segment()?;
            }
            return Ok(());
        }

        let mut out = vec![0u8; OBUF];
        while !input.is_empty() {
            if self.cur.is_none() {
                self.new_segment()?;
            }
            let cur = self.cur.as_mut().unwrap();

            let space = cur
                .seg
                .silo
                .remaining()
                .saturating_sub(gzip::GZIP_CRNLCRNL.len() as u64);
            if space < CLOSE_SPACE {
                self.finish_segment()?;
                continue;
            }
            let obuflen = (space.min(OBUF as u64)) as usize;
            let flush = if space < FLUSH_SPACE {
                FlushCompress::Partial
            } else {
                FlushCompress::None
            };

            // Zeno guard: never hand the compressor more input than half
            // the output space it has to land in.
            let chunk = input.len().min(obuflen / 2);
            let before_in = cur.cz.total_in();
            let before_out = cur.cz.total_out();
            cur.cz
                .compress(&input[..chunk], &mut out[..obuflen], flush)
                .map_err(|e| Error::BadFormat(format!("deflate: {e}")))?;
            let consumed = (cur.cz.total_in() - before_in) as usize;
            let produced = (cur.cz.total_out() - before_out) as usize;

            if consumed > 0 {
                let fed = &input[..consumed];
                cur.crc.update(fed);
                cur.sha.update(fed);
                self.sha_payload.update(fed);
                cur.seg.size += consumed as u64;
                self.size += consumed as u64;
                input = &input[consumed..];
            }
            if produced > 0 {
                cur.seg.silo.write(&out[..produced])?;
            }
        }
        Ok(())
    }

    // ── Commit ───────────────────────────────────────────────────────────────

    /// Flush, derive the object id, and publish every segment.  Returns
    /// the canonical id string; storing an object that is already present
    /// succeeds idempotently.
    pub fn commit(self) -> Result<String> {
        self.commit_inner(false)
    }

    /// Like [`commit`], but an already-present object is an error.
    ///
    /// [`commit`]: SegJob::commit
    pub fn commit_exclusive(self) -> Result<String> {
        self.commit_inner(true)
    }

    fn commit_inner(mut self, exclusive: bool) -> Result<String> {
        self.feed(&[])?;
        if self.size == 0 {
            return Err(Error::BadFormat("cannot store an empty object".to_owned()));
        }

        let n = self.segments.len();
        assert!(n > 0);
        if n > 1 {
            // The object id is derived from the whole payload, not the
            // first segment's block.
            let pd = hex::encode(self.sha_payload.finalize_reset());
            self.segments[0]
                .hd
                .set("WARC-Payload-Digest", format!("sha256:{pd}"));
            let over = self.ident.as_deref();
            ident::set(self.aa, &mut self.segments[0].hd, &pd, over)?;
        }
        let fid = self.segments[0].hd.get_id().to_owned();
        let canonical = ident::digest_to_ident(self.aa, &fid)?;

        match GetJob::new(self.aa, &fid) {
            Ok(_) => {
                if exclusive {
                    return Err(Error::Duplicate(canonical));
                }
                info!("object {fid} already in archive");
                // Dropping the segments abandons their held silos.
                return Ok(canonical);
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if n == 1 {
            let Segment { hd, silo, .. } = self.segments.remove(0);
            silo.commit(&hd, false, &fid, None)?;
            return Ok(canonical);
        }

        let ids: Vec<String> = self
            .segments
            .iter()
            .map(|s| s.hd.get_id().to_owned())
            .collect();
        let total = self.size;
        for (i, seg) in std::mem::take(&mut self.segments).into_iter().enumerate() {
            let Segment {
                segno, mut hd, silo, ..
            } = seg;
            if segno == 1 {
                hd.set("WARC-Segment-Number", 1);
            } else {
                hd.set_ref("WARC-Segment-Origin-ID", &fid);
            }
            let rid = if i + 1 < n {
                Some(ids[i + 1].as_str())
            } else {
                hd.set("WARC-Segment-Total-Length", total);
                None
            };
            silo.commit(&hd, true, &ids[i], rid)?;
        }
        Ok(canonical)
    }
}
