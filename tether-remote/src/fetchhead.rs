//! `FETCH_HEAD` assembly.
//!
//! The core produces an ordered list of entries describing what the last
//! fetch brought in; writing the file itself is the repository's
//! business. Entries flagged [`Entry::is_merge`] come first, in
//! advertisement order within each group.

use crate::Oid;

/// One `FETCH_HEAD` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The object the peer advertised.
    pub oid: Oid,
    /// Whether this ref is intended for the subsequent merge.
    pub is_merge: bool,
    /// The peer-side reference name.
    pub name: String,
    /// The URL the fetch was performed against.
    pub url: String,
}

/// The `FETCH_HEAD` writer.
pub trait FetchHead {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Replace `FETCH_HEAD` with the given entries.
    fn write_fetch_head(&mut self, entries: &[Entry]) -> Result<(), Self::Error>;
}
