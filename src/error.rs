//! Store-wide error taxonomy.
//!
//! One enum covers the whole crate: every layer from the gzip framing up to
//! the CLI speaks the same set of failures, each carrying a contextual
//! message.  I/O and format errors surface to the caller with context;
//! integrity errors found while reading never mutate the archive.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Configuration unreadable, key missing, or value out of range.
    #[error("config: {0}")]
    Config(String),

    /// Underlying file or directory I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Silo framing violated: not an Aa-gzip member, record header fails
    /// the strict parse, or the crnlcrnl separator is absent.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// Identifier has the wrong length, wrong prefix, or non-hex characters.
    #[error("invalid id: {0}")]
    IdInvalid(String),

    /// No index entry for the identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored digest, id, length, or segment chain disagrees with what the
    /// bytes actually are.
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// The object is already in the archive (only reported when the caller
    /// asked for exclusive storage; the default outcome is idempotent).
    #[error("duplicate: {0} already stored")]
    Duplicate(String),

    /// A write would push the silo past `silo.max_size`.
    #[error("silo full")]
    SiloFull,

    /// The gzip stitch found no recognizable end-of-stream block.
    #[error("gzip stitch: unrecognized end-of-stream trailer")]
    StitchBadTrailer,

    /// A `.hold` file required for exclusivity is already present.
    #[error("lock held: {0}")]
    Lock(String),

    /// A record header carries a WARC-Type no identifier can be derived for.
    #[error("unknown WARC-Type: {0}")]
    UnknownWarcType(String),
}
