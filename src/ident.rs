//! Record identifier derivation.
//!
//! Ids are truncations of SHA-256 digests, `id_size` hex characters wide:
//!
//! | `WARC-Type` | id |
//! |---|---|
//! | `resource`, `continuation`, `warcinfo` | payload digest, truncated |
//! | `metadata` | `SHA-256(refers-to + "\n" + payload digest + "\n")`, truncated — unless the caller supplied an id |
//!
//! Metadata records hash in their `WARC-Refers-To` value so that distinct
//! annotations of the same bytes attached to distinct objects get
//! distinct ids.

use sha2::{Digest, Sha256};

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::header::Header;
use crate::index;

/// Derive the id for `hdr` from the payload digest (full hex).  A
/// caller-supplied override is honored for metadata records only, after
/// validation.
pub fn create(
    aa: &Archive,
    hdr: &Header,
    payload_digest: &str,
    ident: Option<&str>,
) -> Result<String> {
    let typ = hdr
        .get("WARC-Type")
        .ok_or_else(|| Error::BadFormat("record has no WARC-Type".to_owned()))?;
    match typ {
        "resource" | "continuation" | "warcinfo" => {
            Ok(payload_digest[..aa.id_size()].to_owned())
        }
        "metadata" => {
            if let Some(id) = ident {
                return index::valid_id(aa, id);
            }
            let refer = hdr.get("WARC-Refers-To").ok_or_else(|| {
                Error::BadFormat("metadata record has no WARC-Refers-To".to_owned())
            })?;
            let mut sha = Sha256::new();
            sha.update(refer.as_bytes());
            sha.update(b"\n");
            sha.update(payload_digest.as_bytes());
            sha.update(b"\n");
            let dig = hex::encode(sha.finalize());
            Ok(dig[..aa.id_size()].to_owned())
        }
        other => Err(Error::UnknownWarcType(other.to_owned())),
    }
}

/// Derive and install the id into the header's fixed slot.
pub fn set(aa: &Archive, hdr: &mut Header, payload_digest: &str, ident: Option<&str>) -> Result<()> {
    let id = create(aa, hdr, payload_digest, ident)?;
    hdr.set_id(&id);
    Ok(())
}

/// Format a digest as the full on-the-wire id and validate it.
pub fn digest_to_ident(aa: &Archive, digest: &str) -> Result<String> {
    let norm = index::valid_id(aa, digest)?;
    Ok(format!("{}{}", aa.prefix(), norm))
}

// ── Tests ────────────────────────────────────────────────────────────────────
