//! Silo reader.
//!
//! A silo is a concatenation of records, each three gzip members long:
//! header member, body member, crnlcrnl separator.  The reader is a
//! cursor over one open silo file, moving through the states
//!
//! ```text
//! AtHeader ── read_header ──► AtBody ── read_chunk /
//!     ▲                         │       read_gz_chunk
//!     │                         ▼
//!     └────── skip_cr_nl ──── AtCrNl
//! ```
//!
//! `read_header` decodes the header member from a single page — record
//! headers must fit in one page, the body member's Aa length is recovered
//! from the unconsumed page tail.  `next_header` skips a record's body
//! without inflating it, via the record-level Aa length.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use flate2::{Decompress, FlushDecompress, Status};

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::gzip;
use crate::header::Header;
use crate::silo;

const PAGE: usize = 4096;

enum State {
    AtHeader,
    AtBody { len: u64, consumed: u64 },
    AtCrNl,
}

pub struct Rsilo<'a> {
    aa:      &'a Archive,
    file:    File,
    silo_no: u32,
    state:   State,
    /// Offset of the current record's first gzip byte.
    record_start: u64,
    /// The record-level Aa length: header member through crnlcrnl.
    record_len:   u64,
}

impl<'a> Rsilo<'a> {
    pub fn open(aa: &'a Archive, silo_no: u32) -> Result<Rsilo<'a>> {
        Self::open_path_numbered(aa, &silo::filename(aa, silo_no), silo_no)
    }

    /// Open an explicit file, outside the numbered silo tree.
    pub fn open_path(aa: &'a Archive, path: &Path) -> Result<Rsilo<'a>> {
        Self::open_path_numbered(aa, path, u32::MAX)
    }

    fn open_path_numbered(aa: &'a Archive, path: &Path, silo_no: u32) -> Result<Rsilo<'a>> {
        let file = File::open(path)?;
        Ok(Rsilo {
            aa,
            file,
            silo_no,
            state: State::AtHeader,
            record_start: 0,
            record_len: 0,
        })
    }

    pub fn silo_no(&self) -> u32 {
        self.silo_no
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    /// Position at a record boundary.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.state = State::AtHeader;
        Ok(())
    }

    /// Re-enter a record's body at `offset`, with `body_len` on-disk
    /// bytes of body member, as previously reported by [`read_header`] /
    /// [`tell`].
    ///
    /// [`read_header`]: Rsilo::read_header
    /// [`tell`]: Rsilo::tell
    pub fn seek_body(&mut self, offset: u64, body_len: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.state = State::AtBody {
            len: body_len,
            consumed: 0,
        };
        Ok(())
    }

    // ── AtHeader ─────────────────────────────────────────────────────────────

    /// Read the record header at the cursor; `None` at end of silo.
    pub fn read_header(&mut self) -> Result<Option<Header>> {
        assert!(matches!(self.state, State::AtHeader));
        let start = self.file.stream_position()?;

        let mut page = [0u8; PAGE];
        let mut got = 0usize;
        while got < PAGE {
            let n = self.file.read(&mut page[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            return Ok(None);
        }
        let page = &page[..got];

        // The record-level length rides in the header member's preamble.
        let record_len = gzip::read_aa(page)?;

        let (text, hdr_end) = gzip::decode_member(page).map_err(|e| match e {
            Error::BadFormat(m) => {
                Error::BadFormat(format!("record header does not fit one page: {m}"))
            }
            e => e,
        })?;
        let hdr = Header::parse(self.aa, &text)?;

        if page.len() < hdr_end + gzip::AA_PREAMBLE {
            return Err(Error::BadFormat(
                "record body member missing after header".to_owned(),
            ));
        }
        let body_len = gzip::read_aa(&page[hdr_end..])?;

        // Drop whatever of the page was past the header member.
        self.file.seek(SeekFrom::Start(start + hdr_end as u64))?;
        self.record_start = start;
        self.record_len = record_len;
        self.state = State::AtBody {
            len: body_len,
            consumed: 0,
        };
        Ok(Some(hdr))
    }

    // ── AtBody ───────────────────────────────────────────────────────────────

    /// On-disk bytes of the body member not yet consumed.
    pub fn body_len(&self) -> u64 {
        match self.state {
            State::AtBody { len, consumed } => len - consumed,
            _ => panic!("body_len outside AtBody"),
        }
    }

    /// Inflate the record body, passing chunks to `sink`; verifies the
    /// body member's trailer.  Returns the uncompressed length.
    pub fn read_chunk(&mut self, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<u64> {
        let member_len = self.body_len();
        if member_len < gzip::MEMBER_MIN {
            return Err(Error::BadFormat("body member impossibly short".to_owned()));
        }

        let mut member_read = 0u64;
        let mut inbuf = vec![0u8; 64 * 1024];
        let mut outbuf = vec![0u8; 64 * 1024];
        let mut filled = 0usize;

        // Preamble first; never read past the member.
        while filled < gzip::AA_PREAMBLE {
            let end = (filled + (member_len - member_read) as usize).min(inbuf.len());
            let n = self.file.read(&mut inbuf[filled..end])?;
            if n == 0 {
                return Err(Error::BadFormat("truncated body member".to_owned()));
            }
            filled += n;
            member_read += n as u64;
        }
        if !gzip::good_aa(&inbuf[..filled]) {
            return Err(Error::BadFormat("body member lacks Aa header".to_owned()));
        }
        let mut taken = gzip::AA_PREAMBLE;

        let mut dz = Decompress::new(false);
        let mut crc = crc32fast::Hasher::new();
        let mut total_out = 0u64;
        loop {
            if taken == filled {
                let want = ((member_len - member_read) as usize).min(inbuf.len());
                if want == 0 {
                    return Err(Error::BadFormat(
                        "body member ended before end-of-stream".to_owned(),
                    ));
                }
                let n = self.file.read(&mut inbuf[..want])?;
                if n == 0 {
                    return Err(Error::BadFormat("truncated body member".to_owned()));
                }
                filled = n;
                taken = 0;
                member_read += n as u64;
            }
            let before_in = dz.total_in();
            let before_out = dz.total_out();
            let status = dz
                .decompress(&inbuf[taken..filled], &mut outbuf, FlushDecompress::None)
                .map_err(|e| Error::BadFormat(format!("inflate: {e}")))?;
            taken += (dz.total_in() - before_in) as usize;
            let produced = (dz.total_out() - before_out) as usize;
            if produced > 0 {
                crc.update(&outbuf[..produced]);
                total_out += produced as u64;
                sink(&outbuf[..produced])?;
            }
            if status == Status::StreamEnd {
                break;
            }
        }

        // Trailer: 8 bytes, possibly split between buffer and file.
        let mut trailer = [0u8; 8];
        let mut t = 0usize;
        while t < 8 && taken < filled {
            trailer[t] = inbuf[taken];
            t += 1;
            taken += 1;
        }
        while t < 8 {
            if member_read >= member_len {
                return Err(Error::BadFormat("body member trailer truncated".to_owned()));
            }
            let n = self.file.read(&mut trailer[t..8])?;
            if n == 0 {
                return Err(Error::BadFormat("body member trailer truncated".to_owned()));
            }
            t += n;
            member_read += n as u64;
        }
        let want_crc = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
        let want_len = u32::from_le_bytes(trailer[4..8].try_into().unwrap());
        if crc.finalize() != want_crc || want_len != total_out as u32 {
            return Err(Error::IntegrityMismatch(
                "body member trailer disagrees with inflated bytes".to_owned(),
            ));
        }
        if member_read != member_len || taken != filled {
            return Err(Error::BadFormat(
                "body member Aa length disagrees with DEFLATE stream".to_owned(),
            ));
        }

        self.state = State::AtCrNl;
        Ok(total_out)
    }

    /// Pass the body member through compressed, preamble and all.
    pub fn read_gz_chunk(&mut self, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<u64> {
        let mut remain = self.body_len();
        let total = remain;
        let mut buf = vec![0u8; 64 * 1024];
        while remain > 0 {
            let want = (remain as usize).min(buf.len());
            let n = self.file.read(&mut buf[..want])?;
            if n == 0 {
                return Err(Error::BadFormat("truncated body member".to_owned()));
            }
            sink(&buf[..n])?;
            remain -= n as u64;
        }
        self.state = State::AtCrNl;
        Ok(total)
    }

    // ── AtCrNl ───────────────────────────────────────────────────────────────

    /// Decode the trailing separator member and verify it spells `\r\n\r\n`.
    pub fn skip_cr_nl(&mut self) -> Result<()> {
        assert!(matches!(self.state, State::AtCrNl));
        let mut buf = [0u8; gzip::GZIP_CRNLCRNL.len()];
        self.file.read_exact(&mut buf)?;
        let (payload, used) = gzip::decode_member(&buf)?;
        if used != buf.len() || payload != b"\r\n\r\n" {
            return Err(Error::BadFormat(
                "record trailer is not the crnlcrnl member".to_owned(),
            ));
        }
        self.state = State::AtHeader;
        Ok(())
    }

    /// Skip from inside a record to the start of the next one without
    /// inflating the body.
    pub fn next_header(&mut self) -> Result<()> {
        assert!(matches!(self.state, State::AtBody { .. }));
        self.seek(self.record_start + self.record_len)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_archive;
    use std::io::Write;

    /// Hand-assemble a record the way the writer lays it out.
    fn make_record(aa: &Archive, body: &[u8]) -> Vec<u8> {
        let mut hd = Header::new(aa);
        hd.set("WARC-Type", "resource");
        hd.set("Content-Type", "application/octet-stream");
        hd.set("Content-Length", body.len());
        hd.set_id(&"c0".repeat(32));
        let mut rec = hd.serialize(0).unwrap();
        rec.extend_from_slice(&gzip::encode_vsb(body, 9).unwrap());
        rec.extend_from_slice(&gzip::GZIP_CRNLCRNL);
        let total = rec.len() as u64;
        gzip::patch_aa(&mut rec, total);
        rec
    }

    #[test]
    fn walk_two_records() {
        let (t, aa) = test_archive(&[]);
        let body1 = b"first body".repeat(100);
        let body2 = b"second".to_vec();
        let path = t.path().join("test.warc.gz");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&make_record(&aa, &body1)).unwrap();
            f.write_all(&make_record(&aa, &body2)).unwrap();
        }

        let mut rs = Rsilo::open_path(&aa, &path).unwrap();

        let hd = rs.read_header().unwrap().unwrap();
        assert_eq!(hd.get("WARC-Type"), Some("resource"));
        assert_eq!(hd.get_number("Content-Length"), body1.len() as i128);
        let mut got = Vec::new();
        let n = rs
            .read_chunk(&mut |c| {
                got.extend_from_slice(c);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, body1.len() as u64);
        assert_eq!(got, body1);
        rs.skip_cr_nl().unwrap();

        // Second record: take the compressed bytes and check they are the
        // body member verbatim.
        let hd = rs.read_header().unwrap().unwrap();
        assert_eq!(hd.get_number("Content-Length"), body2.len() as i128);
        let member = gzip::encode_vsb(&body2, 9).unwrap();
        assert_eq!(rs.body_len(), member.len() as u64);
        let mut gz = Vec::new();
        rs.read_gz_chunk(&mut |c| {
            gz.extend_from_slice(c);
            Ok(())
        })
        .unwrap();
        assert_eq!(gz, member);
        rs.skip_cr_nl().unwrap();

        assert!(rs.read_header().unwrap().is_none());
    }

    #[test]
    fn next_header_skips_without_inflating() {
        let (t, aa) = test_archive(&[]);
        let path = t.path().join("test.warc.gz");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&make_record(&aa, &vec![7u8; 100_000])).unwrap();
            f.write_all(&make_record(&aa, b"tail")).unwrap();
        }
        let mut rs = Rsilo::open_path(&aa, &path).unwrap();
        rs.read_header().unwrap().unwrap();
        rs.next_header().unwrap();
        let hd = rs.read_header().unwrap().unwrap();
        assert_eq!(hd.get_number("Content-Length"), 4);
    }

    #[test]
    fn corrupt_trailer_is_detected() {
        let (t, aa) = test_archive(&[]);
        let path = t.path().join("test.warc.gz");
        let mut rec = make_record(&aa, b"payload");
        let n = rec.len();
        rec[n - 30] ^= 0xff; // damage the body member trailer area
        std::fs::write(&path, &rec).unwrap();

        let mut rs = Rsilo::open_path(&aa, &path).unwrap();
        rs.read_header().unwrap().unwrap();
        let r = rs.read_chunk(&mut |_| Ok(()));
        assert!(r.is_err());
    }
}
