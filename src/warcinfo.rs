//! The warcinfo record — record #0 of every silo.
//!
//! Its body is `application/warc-fields` text assembled from the
//! `warcinfo.body` configuration section, with a `software:` line added
//! when the operator did not supply one.  The record id hashes the body
//! digest together with the silo's filename, so every silo's warcinfo is
//! distinct even when the bodies are identical.

use sha2::{Digest, Sha256};

use crate::archive::Archive;
use crate::error::Result;
use crate::gzip;
use crate::header::Header;
use crate::wsilo::Wsilo;

/// Build and emit the warcinfo record into a freshly held silo; returns
/// its record id.
pub fn emit(aa: &Archive, sl: &mut Wsilo, silo_no: u32) -> Result<String> {
    // Body first: the header needs its length and digest.
    let mut body = String::new();
    let mut have_software = false;
    for (name, arg) in aa.cfg().entries("warcinfo.body") {
        body.push_str(name);
        if let Some(arg) = arg {
            body.push(' ');
            body.push_str(arg);
        }
        body.push_str("\r\n");
        if name.eq_ignore_ascii_case("software:") {
            have_software = true;
        }
    }
    if !have_software {
        body.push_str(&format!(
            "software: aardwarc/{}\r\n",
            env!("CARGO_PKG_VERSION")
        ));
    }
    let body = body.into_bytes();
    let body_digest = hex::encode(Sha256::digest(&body));

    let mut hd = Header::new(aa);
    hd.set_date();
    hd.set("WARC-Type", "warcinfo");
    hd.set("Content-Type", "application/warc-fields");
    hd.set("Content-Length", body.len());
    hd.set("WARC-Block-Digest", format!("sha256:{body_digest}"));
    let filename = aa.silo_basename(silo_no);
    hd.set("WARC-Filename", &filename);

    let mut sha = Sha256::new();
    sha.update(body_digest.as_bytes());
    sha.update(b"\n");
    sha.update(filename.as_bytes());
    sha.update(b"\n");
    let id = hex::encode(sha.finalize())[..aa.id_size()].to_owned();
    hd.set_id(&id);

    let body_member = gzip::encode_vsb(&body, 0)?;
    let mut hdr_member = hd.serialize(0)?;
    let record_len =
        (hdr_member.len() + body_member.len() + gzip::GZIP_CRNLCRNL.len()) as u64;
    gzip::patch_aa(&mut hdr_member, record_len);

    sl.write(&hdr_member)?;
    sl.write(&body_member)?;
    sl.write(&gzip::GZIP_CRNLCRNL)?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_archive_with;
    use crate::rsilo::Rsilo;
    use crate::silo;

    #[test]
    fn warcinfo_carries_config_body_and_software_line() {
        let (_t, aa) = test_archive_with(
            &[],
            &["warcinfo.body:", "\toperator: someone@example.com", "\tdescription test store"],
        );
        // Publish silo 0 with one stored object so the file exists.
        {
            use crate::header::Header;
            let body = b"x";
            let digest = hex::encode(Sha256::digest(body));
            let mut hd = Header::new(&aa);
            hd.set("WARC-Type", "resource");
            hd.set("Content-Type", "text/plain");
            hd.set("Content-Length", 1);
            hd.set("WARC-Block-Digest", format!("sha256:{digest}"));
            hd.set_id(&digest);
            let mut sl = Wsilo::new(&aa).unwrap();
            sl.header(&hd, 16).unwrap();
            sl.write(&gzip::encode_vsb(body, 9).unwrap()).unwrap();
            sl.write(&gzip::GZIP_CRNLCRNL).unwrap();
            sl.finish();
            sl.commit(&hd, false, &digest[..32], None).unwrap();
        }

        let mut rs = Rsilo::open(&aa, 0).unwrap();
        let hd = rs.read_header().unwrap().unwrap();
        assert_eq!(hd.get("WARC-Type"), Some("warcinfo"));
        assert_eq!(hd.get("Content-Type"), Some("application/warc-fields"));
        assert_eq!(hd.get("WARC-Filename").unwrap(), aa.silo_basename(0));

        let mut body = Vec::new();
        rs.read_chunk(&mut |c| {
            body.extend_from_slice(c);
            Ok(())
        })
        .unwrap();
        rs.skip_cr_nl().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("operator: someone@example.com\r\n"));
        assert!(text.contains("description test store\r\n"));
        assert!(text.contains("software: aardwarc/"));
        assert_eq!(hd.get_number("Content-Length"), text.len() as i128);

        // The warcinfo of another silo gets a different id.
        assert!(silo::filename(&aa, 0).is_file());
    }
}
