//! Aa gzip framing — encode/decode the members every silo is built from.
//!
//! # Member layout (24-byte preamble, numeric fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      2   ID1 ID2        = 1f 8b
//!    2      1   CM             = 08 (DEFLATE)
//!    3      1   FLG            = 04 (FEXTRA)
//!    4      4   MTIME          = 0
//!    8      1   XFL            2 or 4 (normalized to 2 for compare)
//!    9      1   OS             = 3 (UNIX)
//!   10      2   XLEN           = 12
//!   12      2   SI1 SI2        = 'A' 'a'
//!   14      2   LEN            = 8
//!   16      8   Aa length      (LE u64, patched in place once known)
//!   24      …   DEFLATE data
//!   end−8    4  CRC32 of the uncompressed payload (LE)
//!   end−4    4  ISIZE, payload length mod 2^32 (LE)
//! ```
//!
//! The Aa length makes a concatenated silo seekable: any member can be
//! skipped without inflating it.  Which length it carries depends on the
//! member's role — a record's header member holds the whole record's
//! on-disk size (through the crnlcrnl separator), a body member holds its
//! own size.  See `wsilo`/`rsilo`.
//!
//! # Stitchable tails
//!
//! Every Aa member written here ends its DEFLATE data with an explicit
//! empty stored block (`00 00 00 ff ff`) followed by the end-of-stream
//! block, so the final 13 bytes of a member are one of exactly two shapes:
//!
//! ```text
//! 01 00 00 ff ff  <crc32> <isize>      stored final block
//! .. 00 ff ff 03 00  <crc32> <isize>   fixed final block after the
//!                                      empty stored block
//! ```
//!
//! [`GzipStitch`] exploits this: it strips each member's preamble and
//! 13-byte tail, passes the DEFLATE bodies through unchanged, and closes
//! the output with a single combined trailer.  The result is one valid
//! RFC 1952 stream whose payload is the concatenation of the members'
//! payloads — no recompression.

use std::fs::File;
use std::os::unix::fs::FileExt;

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};

// ── Frame constants ──────────────────────────────────────────────────────────

/// The fixed gzip header prefix every Aa member starts with (XFL = 2 here;
/// 4 is accepted on read).
pub const GZIP_HEAD: [u8; 16] = [
    0x1f, 0x8b,             // ID1 ID2
    0x08,                   // CM
    0x04,                   // FLG: FEXTRA
    0x00, 0x00, 0x00, 0x00, // MTIME
    0x02,                   // XFL
    0x03,                   // OS
    0x0c, 0x00,             // XLEN
    b'A', b'a',             // SI1 SI2
    0x08, 0x00,             // LEN
];

/// Preamble size: `GZIP_HEAD` plus the LE64 Aa length.
pub const AA_PREAMBLE: usize = GZIP_HEAD.len() + 8;

/// Final bytes of a stitchable member: stop block plus gzip trailer.
pub const MEMBER_TAIL: usize = 13;

/// Smallest possible Aa member (empty payload).
pub const MEMBER_MIN: u64 = (AA_PREAMBLE + MEMBER_TAIL) as u64;

/// The record separator: a complete fixed gzip member encoding `\r\n\r\n`.
pub const GZIP_CRNLCRNL: [u8; 24] = [
    0x1f, 0x8b, 0x08, 0x00, 0x20, 0x01, 0x19, 0x66,
    0x02, 0x03, 0xe3, 0xe5, 0xe2, 0xe5, 0x02, 0x00,
    0x44, 0x15, 0xc2, 0x8b, 0x04, 0x00, 0x00, 0x00,
];

/// Plain 10-byte gzip header emitted at the start of a stitched stream.
const PLAIN_HEAD: [u8; 10] = [
    0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x03,
];

/// Empty non-final stored block; keeps the DEFLATE stream byte-aligned.
const EMPTY_STORED: [u8; 5] = [0x00, 0x00, 0x00, 0xff, 0xff];

/// Final fixed-Huffman block containing only the end-of-block code.
const EOS_FIXED: [u8; 2] = [0x03, 0x00];

/// Final empty stored block, as emitted when closing a stitched stream.
const EOS_STORED: [u8; 5] = [0x01, 0x00, 0x00, 0xff, 0xff];

// ── Aa field access ──────────────────────────────────────────────────────────

/// Check that `p` starts with the Aa gzip header.  XFL may be 2 or 4 and is
/// normalized to 2 before comparing.
pub fn good_aa(p: &[u8]) -> bool {
    if p.len() < GZIP_HEAD.len() {
        return false;
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&p[..16]);
    if buf[8] != 0x02 && buf[8] != 0x04 {
        return false;
    }
    buf[8] = 0x02;
    buf == GZIP_HEAD
}

/// Extract the Aa length from a member preamble.
pub fn read_aa(p: &[u8]) -> Result<u64> {
    if p.len() < AA_PREAMBLE || !good_aa(p) {
        return Err(Error::BadFormat("not an Aa gzip member".to_owned()));
    }
    Ok(LittleEndian::read_u64(&p[16..24]))
}

/// Patch the Aa length of a member held in memory.
pub fn patch_aa(member: &mut [u8], len: u64) {
    debug_assert!(good_aa(member));
    LittleEndian::write_u64(&mut member[16..24], len);
}

/// Patch the Aa length of a member at `offset` in `file`.
pub fn patch_aa_at(file: &File, offset: u64, len: u64) -> Result<()> {
    let mut head = [0u8; AA_PREAMBLE];
    file.read_exact_at(&mut head, offset)?;
    if !good_aa(&head) {
        return Err(Error::BadFormat(format!(
            "no Aa gzip member at offset {offset}"
        )));
    }
    let mut enc = [0u8; 8];
    LittleEndian::write_u64(&mut enc, len);
    file.write_all_at(&enc, offset + 16)?;
    Ok(())
}

// ── One-shot member encoding ─────────────────────────────────────────────────

fn deflate_err(e: impl std::fmt::Display) -> Error {
    Error::BadFormat(format!("deflate: {e}"))
}

fn inflate_err(e: impl std::fmt::Display) -> Error {
    Error::BadFormat(format!("inflate: {e}"))
}

/// The stop block and trailer closing a stitchable member.
pub(crate) fn member_close(crc: u32, isize: u32) -> [u8; 15] {
    let mut t = [0u8; 15];
    t[..5].copy_from_slice(&EMPTY_STORED);
    t[5..7].copy_from_slice(&EOS_FIXED);
    LittleEndian::write_u32(&mut t[7..11], crc);
    LittleEndian::write_u32(&mut t[11..15], isize);
    t
}

/// Compress `data` into a single Aa member with a stitchable tail.  The Aa
/// length is patched to the member's own on-disk size; callers that embed
/// the member in a larger record re-patch it.
pub fn encode_vsb(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    out.extend_from_slice(&GZIP_HEAD);
    out.extend_from_slice(&[0u8; 8]);

    let mut cz = Compress::new(Compression::new(level), false);
    let mut buf = [0u8; 32 * 1024];
    let mut pos = 0usize;
    loop {
        let before_in = cz.total_in();
        let before_out = cz.total_out();
        cz.compress(&data[pos..], &mut buf, FlushCompress::Sync)
            .map_err(deflate_err)?;
        pos += (cz.total_in() - before_in) as usize;
        let produced = (cz.total_out() - before_out) as usize;
        out.extend_from_slice(&buf[..produced]);
        if pos == data.len() && produced == 0 {
            break;
        }
    }

    out.extend_from_slice(&member_close(crc32(data), data.len() as u32));
    let total = out.len() as u64;
    patch_aa(&mut out, total);
    Ok(out)
}

fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

// ── One-shot member decoding ─────────────────────────────────────────────────

/// Decode one complete gzip member at the start of `bytes`.  Accepts both Aa
/// members and plain ones (FLG 0), verifies the CRC32/ISIZE trailer, and
/// returns the payload together with the member's on-disk length.
pub fn decode_member(bytes: &[u8]) -> Result<(Vec<u8>, usize)> {
    if bytes.len() < 10 || bytes[0] != 0x1f || bytes[1] != 0x8b || bytes[2] != 0x08 {
        return Err(Error::BadFormat("not a gzip member".to_owned()));
    }
    let flg = bytes[3];
    let mut off = 10usize;
    if flg & 0x04 != 0 {
        if bytes.len() < off + 2 {
            return Err(Error::BadFormat("truncated gzip FEXTRA".to_owned()));
        }
        off += 2 + LittleEndian::read_u16(&bytes[off..off + 2]) as usize;
    }
    if flg & !0x04 != 0 {
        return Err(Error::BadFormat(format!("unsupported gzip FLG {flg:#04x}")));
    }
    if bytes.len() < off {
        return Err(Error::BadFormat("truncated gzip header".to_owned()));
    }

    let mut dz = Decompress::new(false);
    let mut payload = Vec::new();
    let mut buf = [0u8; 32 * 1024];
    let mut end = false;
    while !end {
        let before_out = dz.total_out();
        let input = &bytes[off + dz.total_in() as usize..];
        if input.is_empty() {
            return Err(Error::BadFormat("truncated gzip member".to_owned()));
        }
        let status = dz
            .decompress(input, &mut buf, FlushDecompress::None)
            .map_err(inflate_err)?;
        payload.extend_from_slice(&buf[..(dz.total_out() - before_out) as usize]);
        end = status == flate2::Status::StreamEnd;
    }

    let tail = off + dz.total_in() as usize;
    if bytes.len() < tail + 8 {
        return Err(Error::BadFormat("truncated gzip trailer".to_owned()));
    }
    let crc = LittleEndian::read_u32(&bytes[tail..tail + 4]);
    let isize = LittleEndian::read_u32(&bytes[tail + 4..tail + 8]);
    if crc != crc32(&payload) || isize != payload.len() as u32 {
        return Err(Error::IntegrityMismatch(
            "gzip member trailer disagrees with payload".to_owned(),
        ));
    }
    Ok((payload, tail + 8))
}

// ── CRC32 combination ────────────────────────────────────────────────────────

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0u32;
    let mut i = 0usize;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// CRC32 of `a || b` given `crc32(a)`, `crc32(b)` and `len(b)`, without
/// touching the bytes.  The GF(2) matrix walk applies the "shift by one
/// zero byte" operator `len2` times in log steps.
pub fn crc32_combine(crc1: u32, crc2: u32, mut len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }
    let mut even = [0u32; 32];
    let mut odd = [0u32; 32];

    // Operator for one zero bit.
    odd[0] = 0xedb8_8320;
    let mut row = 1u32;
    for item in odd.iter_mut().skip(1) {
        *item = row;
        row <<= 1;
    }
    // Square to one zero byte (even), then two (odd).
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc = crc1;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc = gf2_matrix_times(&even, crc);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc = gf2_matrix_times(&odd, crc);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }
    crc ^ crc2
}

// ── Gzip stitch ──────────────────────────────────────────────────────────────

enum StitchState {
    /// Accumulating a member's 24-byte preamble.
    Outside,
    /// Passing DEFLATE bytes through; `remain` left before the tail.
    Inside { remain: u64 },
    /// Accumulating the member's final 13 bytes.
    Tail,
}

/// Turns N consecutive Aa members into one valid gzip stream.
///
/// Feed the members' raw on-disk bytes in order, then call [`finish`].
/// Output goes to the sink as it is produced.  Fails with
/// [`Error::StitchBadTrailer`] if a member does not end in one of the two
/// recognized end-of-stream shapes.
///
/// [`finish`]: GzipStitch::finish
pub struct GzipStitch<'a> {
    sink:     &'a mut dyn FnMut(&[u8]) -> Result<()>,
    state:    StitchState,
    head:     [u8; AA_PREAMBLE],
    head_len: usize,
    tail:     [u8; MEMBER_TAIL],
    tail_len: usize,
    crc:      u32,
    total:    u32,
    members:  u64,
}

impl<'a> GzipStitch<'a> {
    pub fn new(sink: &'a mut dyn FnMut(&[u8]) -> Result<()>) -> Self {
        GzipStitch {
            sink,
            state: StitchState::Outside,
            head: [0u8; AA_PREAMBLE],
            head_len: 0,
            tail: [0u8; MEMBER_TAIL],
            tail_len: 0,
            crc: 0,
            total: 0,
            members: 0,
        }
    }

    pub fn feed(&mut self, mut p: &[u8]) -> Result<()> {
        while !p.is_empty() {
            match self.state {
                StitchState::Outside => {
                    let want = AA_PREAMBLE - self.head_len;
                    let take = want.min(p.len());
                    self.head[self.head_len..self.head_len + take]
                        .copy_from_slice(&p[..take]);
                    self.head_len += take;
                    p = &p[take..];
                    if self.head_len == AA_PREAMBLE {
                        self.begin_member()?;
                    }
                }
                StitchState::Inside { ref mut remain } => {
                    let take = (*remain).min(p.len() as u64) as usize;
                    *remain -= take as u64;
                    let done = *remain == 0;
                    (self.sink)(&p[..take])?;
                    p = &p[take..];
                    if done {
                        self.state = StitchState::Tail;
                        self.tail_len = 0;
                    }
                }
                StitchState::Tail => {
                    let want = MEMBER_TAIL - self.tail_len;
                    let take = want.min(p.len());
                    self.tail[self.tail_len..self.tail_len + take]
                        .copy_from_slice(&p[..take]);
                    self.tail_len += take;
                    p = &p[take..];
                    if self.tail_len == MEMBER_TAIL {
                        self.end_member()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// All members fed; emit the combined end-of-stream block and trailer.
    pub fn finish(mut self) -> Result<()> {
        if !matches!(self.state, StitchState::Outside) || self.head_len != 0 {
            return Err(Error::BadFormat(
                "gzip stitch: truncated input member".to_owned(),
            ));
        }
        if self.members == 0 {
            (self.sink)(&PLAIN_HEAD)?;
        }
        let mut tail = [0u8; MEMBER_TAIL];
        tail[..5].copy_from_slice(&EOS_STORED);
        LittleEndian::write_u32(&mut tail[5..9], self.crc);
        LittleEndian::write_u32(&mut tail[9..13], self.total);
        (self.sink)(&tail)
    }

    fn begin_member(&mut self) -> Result<()> {
        let len = read_aa(&self.head)?;
        if len < MEMBER_MIN {
            return Err(Error::BadFormat(format!(
                "gzip stitch: Aa length {len} below minimum member size"
            )));
        }
        if self.members == 0 {
            (self.sink)(&PLAIN_HEAD)?;
        }
        self.members += 1;
        self.head_len = 0;
        self.state = StitchState::Inside {
            remain: len - MEMBER_MIN,
        };
        // A member whose DEFLATE data is nothing but the tail goes straight
        // to tail accumulation.
        if let StitchState::Inside { remain: 0 } = self.state {
            self.state = StitchState::Tail;
            self.tail_len = 0;
        }
        Ok(())
    }

    fn end_member(&mut self) -> Result<()> {
        if self.tail[..5] == EOS_STORED {
            // Stored final block: drops cleanly.
        } else if self.tail[..3] == [0x00, 0xff, 0xff] && self.tail[3..5] == EOS_FIXED {
            // Fixed final block.  The first two bytes of the empty stored
            // block before it have already been passed through; re-emit the
            // remaining three so the block stays whole.
            let fix = [self.tail[0], self.tail[1], self.tail[2]];
            (self.sink)(&fix)?;
        } else {
            return Err(Error::StitchBadTrailer);
        }
        let crc = LittleEndian::read_u32(&self.tail[5..9]);
        let len = LittleEndian::read_u32(&self.tail[9..13]);
        self.crc = crc32_combine(self.crc, crc, len as u64);
        self.total = self.total.wrapping_add(len);
        self.tail_len = 0;
        self.state = StitchState::Outside;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn member_roundtrip() {
        for level in [0u32, 1, 6, 9] {
            let data = b"The quick brown fox jumps over the lazy dog".repeat(7);
            let member = encode_vsb(&data, level).unwrap();
            assert!(good_aa(&member));
            assert_eq!(read_aa(&member).unwrap(), member.len() as u64);
            let (payload, used) = decode_member(&member).unwrap();
            assert_eq!(used, member.len());
            assert_eq!(payload, data);
            assert_eq!(gunzip(&member), data);
        }
    }

    #[test]
    fn empty_member() {
        let member = encode_vsb(b"", 6).unwrap();
        assert!(member.len() as u64 >= MEMBER_MIN);
        let (payload, used) = decode_member(&member).unwrap();
        assert_eq!(used, member.len());
        assert!(payload.is_empty());
    }

    #[test]
    fn xfl_tolerance() {
        let mut member = encode_vsb(b"x", 6).unwrap();
        assert!(good_aa(&member));
        member[8] = 0x04;
        assert!(good_aa(&member));
        member[8] = 0x07;
        assert!(!good_aa(&member));
    }

    #[test]
    fn patching() {
        let mut member = encode_vsb(b"abc", 6).unwrap();
        patch_aa(&mut member, 12345);
        assert_eq!(read_aa(&member).unwrap(), 12345);
    }

    #[test]
    fn crnlcrnl_is_crnlcrnl() {
        let (payload, used) = decode_member(&GZIP_CRNLCRNL).unwrap();
        assert_eq!(used, GZIP_CRNLCRNL.len());
        assert_eq!(payload, b"\r\n\r\n");
    }

    #[test]
    fn combine_matches_whole() {
        let a = b"hello, ".as_slice();
        let b = b"world \x00\x01\x02".as_slice();
        let whole = {
            let mut h = crc32fast::Hasher::new();
            h.update(a);
            h.update(b);
            h.finalize()
        };
        assert_eq!(crc32_combine(crc32(a), crc32(b), b.len() as u64), whole);
        assert_eq!(crc32_combine(crc32(a), crc32(b""), 0), crc32(a));
    }

    #[test]
    fn stitch_mixed_members() {
        let parts: [&[u8]; 3] = [b"a", b"", b"bbb"];
        let mut input = Vec::new();
        for p in parts {
            input.extend_from_slice(&encode_vsb(p, 6).unwrap());
        }

        let mut out = Vec::new();
        {
            let mut sink = |chunk: &[u8]| {
                out.extend_from_slice(chunk);
                Ok(())
            };
            let mut st = GzipStitch::new(&mut sink);
            // Feed in awkward slices to exercise the state machine.
            for chunk in input.chunks(7) {
                st.feed(chunk).unwrap();
            }
            st.finish().unwrap();
        }
        assert_eq!(gunzip(&out), b"abbb");
    }

    #[test]
    fn stitch_rejects_garbage_tail() {
        let mut member = encode_vsb(b"payload", 6).unwrap();
        let n = member.len();
        member[n - 13..n - 8].copy_from_slice(&[9, 9, 9, 9, 9]);

        let mut sink = |_: &[u8]| Ok(());
        let mut st = GzipStitch::new(&mut sink);
        let r = st.feed(&member);
        assert!(matches!(r, Err(Error::StitchBadTrailer)));
    }
}
