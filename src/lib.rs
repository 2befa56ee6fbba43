//! # aardwarc — content-addressed archival object store
//!
//! Objects are WARC 1.1 records, individually gzip-framed with the "Aa"
//! extra field and packed into append-only silo files; a sorted,
//! bucket-assisted binary index maps truncated SHA-256 ids to
//! (silo, offset).  Format guarantees:
//!
//! - Every record is addressed by a truncation of a SHA-256 digest;
//!   stores are idempotent — re-storing yields the same id
//! - Silos are append-only: no deletion, no mutation, link-not-rename
//!   publication; a silo never exceeds `silo.max_size`
//! - Any silo offset either lands on a gzip ID1 byte or past EOF; the Aa
//!   length field makes records skippable without inflating them
//! - Record #0 of every silo is a warcinfo record describing the archive
//! - Objects larger than a silo become a chain of continuation segments,
//!   reassembled transparently on read — including as one stitched gzip
//!   stream
//! - Multi-process coordination is cooperative: `.hold` files claim silo
//!   numbers and serialize index merges; readers need no locks
//!
//! The index file layouts (32-byte big-endian entries, the `0x4161`
//! sorted header) and the gzip framing are frozen; see the module docs.

pub mod archive;
pub mod config;
pub mod error;
pub mod getjob;
pub mod gzip;
pub mod header;
pub mod ident;
pub mod index;
pub mod rsilo;
pub mod segjob;
pub mod silo;
pub mod warcinfo;
pub mod wsilo;

// Flat re-exports for the most common types.
pub use archive::Archive;
pub use error::{Error, Result};
pub use getjob::GetJob;
pub use header::Header;
pub use rsilo::Rsilo;
pub use segjob::SegJob;
pub use wsilo::Wsilo;
