//! Object retrieval: resolve an id to its segment chain and stream it.
//!
//! Resolution starts from the index entries matching the full id,
//! verifies the record header really carries that id, then follows the
//! continuation hints: each index entry's `cont` field narrows the search
//! for the next segment, and candidates are accepted only if their
//! `WARC-Segment-Origin-ID` points back at segment 1 and their segment
//! number is exactly the successor.  Truncated keys make false index
//! candidates possible; every acceptance is confirmed against the record
//! header itself.
//!
//! Iteration yields either the decompressed payload, or — `gzip` mode —
//! a single valid gzip stream: the sole body member passed through
//! verbatim, or N members stitched into one (see [`crate::gzip`]).

use log::debug;

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::gzip::GzipStitch;
use crate::header::Header;
use crate::index::{self, Entry};
use crate::rsilo::Rsilo;

struct GetSeg<'a> {
    rs:      Rsilo<'a>,
    hd:      Header,
    flags:   u32,
    cont:    String,
    segno:   u32,
    /// Silo offset of the body member.
    body:    u64,
    /// On-disk size of the body member.
    body_gz: u64,
}

pub struct GetJob<'a> {
    aa:   &'a Archive,
    id:   String,
    segs: Vec<GetSeg<'a>>,
}

fn candidates(aa: &Archive, part: &str) -> Result<Vec<Entry>> {
    let mut out = Vec::new();
    index::iter(aa, Some(part), &mut |e| {
        out.push(e.clone());
        Ok(false)
    })?;
    Ok(out)
}

impl<'a> GetJob<'a> {
    /// Resolve `id` (with or without the archive prefix) to its complete
    /// segment chain.
    pub fn new(aa: &'a Archive, id: &str) -> Result<GetJob<'a>> {
        let nid = index::valid_id(aa, id)?;
        let mut gj = GetJob {
            aa,
            id: nid,
            segs: Vec::new(),
        };

        let mut want = gj.id.clone();
        loop {
            let mut accepted = None;
            for e in candidates(aa, &want)? {
                if let Some(seg) = gj.try_candidate(&e)? {
                    accepted = Some(seg);
                    break;
                }
            }
            let Some(seg) = accepted else {
                if gj.segs.is_empty() {
                    return Err(Error::NotFound(gj.id));
                }
                return Err(Error::IntegrityMismatch(format!(
                    "segment chain of {} breaks after segment {}",
                    gj.id,
                    gj.segs.len()
                )));
            };
            let first = gj.segs.is_empty();
            if first {
                if seg.flags & index::F_WARCINFO != 0 {
                    return Err(Error::IdInvalid(format!(
                        "{} is a warcinfo record",
                        gj.id
                    )));
                }
                if seg.flags & index::F_SEGMENTED != 0 && seg.flags & index::F_FIRSTSEG == 0 {
                    return Err(Error::IdInvalid(format!(
                        "{} is a continuation segment, not an object",
                        gj.id
                    )));
                }
            }
            let flags = seg.flags;
            let cont = seg.cont.clone();
            gj.segs.push(seg);

            if flags & index::F_SEGMENTED == 0 || flags & index::F_LASTSEG != 0 {
                break;
            }
            want = cont;
        }
        debug!("resolved {} to {} segment(s)", gj.id, gj.segs.len());
        Ok(gj)
    }

    /// Open a candidate entry and check it really is the next link of
    /// this chain; `None` means "not ours", not an error.
    fn try_candidate(&self, e: &Entry) -> Result<Option<GetSeg<'a>>> {
        let mut rs = Rsilo::open(self.aa, e.silo)?;
        rs.seek(e.offset)?;
        let hd = rs.read_header()?.ok_or_else(|| {
            Error::BadFormat(format!(
                "index entry points past the end of silo {}",
                e.silo
            ))
        })?;

        let segno = match self.segs.last() {
            None => {
                if !hd.get_id().eq_ignore_ascii_case(&self.id) {
                    return Ok(None);
                }
                1
            }
            Some(prev) => {
                let Some(origin) = hd.get("WARC-Segment-Origin-ID") else {
                    return Ok(None);
                };
                let expect = format!("<{}{}>", self.aa.prefix(), self.id);
                if !origin.eq_ignore_ascii_case(&expect) {
                    return Ok(None);
                }
                let segno = hd.get_number("WARC-Segment-Number");
                if segno != i128::from(prev.segno) + 1 {
                    return Ok(None);
                }
                segno as u32
            }
        };

        let body = rs.tell()?;
        let body_gz = rs.body_len();
        Ok(Some(GetSeg {
            rs,
            hd,
            flags: e.flags,
            cont: e.cont.clone(),
            segno,
            body,
            body_gz,
        }))
    }

    // ── Streaming ────────────────────────────────────────────────────────────

    /// Stream the object.  `gzip` false yields the payload bytes; `gzip`
    /// true yields one valid gzip stream of the whole payload.
    pub fn iter(&mut self, sink: &mut dyn FnMut(&[u8]) -> Result<()>, gzip: bool) -> Result<()> {
        let stitched = gzip && self.segs.len() > 1;
        if stitched {
            let mut stitch = GzipStitch::new(sink);
            for seg in &mut self.segs {
                seg.rs.seek_body(seg.body, seg.body_gz)?;
                seg.rs.read_gz_chunk(&mut |c| stitch.feed(c))?;
            }
            return stitch.finish();
        }
        for seg in &mut self.segs {
            seg.rs.seek_body(seg.body, seg.body_gz)?;
            if gzip {
                seg.rs.read_gz_chunk(sink)?;
            } else {
                seg.rs.read_chunk(sink)?;
            }
        }
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    /// First or last segment's header as stored.
    pub fn header(&self, first: bool) -> &Header {
        if first {
            &self.segs[0].hd
        } else {
            &self.segs[self.segs.len() - 1].hd
        }
    }

    /// The object's logical header: for a segmented object, segment 1's
    /// header with the whole-object length and payload digest swapped in.
    pub fn headers(&self) -> Result<Vec<u8>> {
        let first = &self.segs[0];
        if self.segs.len() == 1 {
            return first.hd.serialize(-1);
        }
        let last = &self.segs[self.segs.len() - 1].hd;
        let mut hd = first.hd.clone();
        let total = last.get("WARC-Segment-Total-Length").ok_or_else(|| {
            Error::IntegrityMismatch("last segment lacks WARC-Segment-Total-Length".to_owned())
        })?;
        hd.set("Content-Length", total);
        let pd = first.hd.get("WARC-Payload-Digest").ok_or_else(|| {
            Error::IntegrityMismatch("first segment lacks WARC-Payload-Digest".to_owned())
        })?;
        hd.set("WARC-Block-Digest", pd);
        hd.serialize(-1)
    }

    /// Declared object size: payload bytes, or on-disk body-member bytes
    /// in `gzip` mode.
    pub fn total_length(&self, gzip: bool) -> u64 {
        self.segs
            .iter()
            .map(|s| {
                if gzip {
                    s.body_gz
                } else {
                    s.hd.get_number("Content-Length").max(0) as u64
                }
            })
            .sum()
    }

    pub fn is_segmented(&self) -> bool {
        self.segs.len() > 1
    }
}
