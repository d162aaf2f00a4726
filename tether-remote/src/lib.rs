//! Remote coordination for the tether version-control client.
//!
//! This crate drives the conversation with a named peer repository: it
//! resolves and rewrites URLs, selects a wire transport, performs the
//! handshake and reference advertisement, negotiates and transfers object
//! packs, and reconciles the local reference store afterwards (including
//! `FETCH_HEAD` assembly, opportunistic remote-tracking updates and
//! pruning).
//!
//! The crate deliberately implements none of the surrounding machinery:
//! the configuration store ([`config::ConfigRead`]), the reference
//! database ([`refdb::Refdb`]), the object database ([`odb::Odb`]), the
//! `FETCH_HEAD` writer ([`fetchhead::FetchHead`]) and the wire transports
//! ([`transport::Transport`]) are all consumed as services. A repository
//! handle that implements the first four is a [`Context`], and is passed
//! into every operation that touches local state.
//!
//! Operations are resumable: any stage that would block on the network
//! returns [`Poll::Pending`] together with the file descriptor readiness
//! it is waiting for, and is re-entered through [`Remote::perform`]. When
//! the caller does not opt into cooperative scheduling, a built-in
//! blocking driver waits on the descriptor itself, which makes the whole
//! facility usable as a plain synchronous API.

#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod callbacks;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod fetchhead;
pub mod odb;
pub mod push;
pub mod refdb;
pub mod refspec;
pub mod remote;
pub mod transport;

pub(crate) mod io;
pub(crate) mod tips;

#[cfg(any(test, feature = "test"))]
pub mod test;

use std::convert::Infallible;

use either::Either;
use git_ref_format::{RefStr, RefString};
use git_ref_format::refspec::PatternStr;
use thiserror::Error;

pub use callbacks::{Callbacks, Discard, ReadinessSink};
pub use engine::{Events, Poll, Readiness};
pub use fetch::{FetchOptions, Prune, TagPolicy, TransferProgress};
pub use push::{PushOptions, PushStatus, PushUpdate};
pub use refspec::Refspec;
pub use remote::{ConnectOptions, CreateFlags, CreateOptions, Remote};
pub use transport::{Proxy, RemoteHead, Transport};

/// Object identifier, as advertised by peers and stored in references.
pub type Oid = gix_hash::ObjectId;

/// The all-zero [`Oid`], denoting an absent or deleted reference.
pub(crate) fn zero_oid() -> Oid {
    Oid::null(gix_hash::Kind::Sha1)
}

/// Whether an operation moves data from the peer to us, or the other way
/// around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Fetch,
    Push,
}

/// A boxed service error, as produced by the configuration, reference
/// and object store implementations.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the public entry points.
///
/// Cooperative suspension is *not* an error: it is [`Poll::Pending`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed argument or precondition violation: an empty or missing
    /// URL, a detached remote asked to touch persisted state, or
    /// [`Remote::perform`] on an idle remote.
    #[error("{0}")]
    Invalid(String),
    /// The remote name does not satisfy the reference grammar.
    #[error("invalid remote name {0:?}")]
    InvalidName(String),
    /// A refspec failed to parse.
    #[error(transparent)]
    Refspec(#[from] refspec::ParseError),
    /// No remote with the given name is configured.
    #[error("remote {0:?} does not exist")]
    NotFound(String),
    /// The peer advertisement does not allow determining a default branch.
    #[error("could not determine the default branch of the remote")]
    NoDefaultBranch,
    /// A remote with the given name is already configured.
    #[error("remote {0:?} already exists")]
    Exists(String),
    /// Another operation is in progress on this remote.
    #[error("a remote operation is already in progress")]
    Busy,
    /// The transport failed, was canceled, or timed out.
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// The continuation stack is full. Like transport failures, this
    /// terminates the in-flight operation.
    #[error("continuation stack limit exceeded")]
    StackLimit,
    /// The configuration store failed.
    #[error("configuration store: {0}")]
    Config(#[source] BoxedError),
    /// The reference database failed.
    #[error("reference storage: {0}")]
    Refdb(#[source] BoxedError),
    /// The object database failed.
    #[error("object storage: {0}")]
    Odb(#[source] BoxedError),
    /// Writing `FETCH_HEAD` failed.
    #[error("FETCH_HEAD: {0}")]
    FetchHead(#[source] BoxedError),
}

impl Error {
    pub(crate) fn config<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Config(Box::new(err))
    }

    pub(crate) fn refdb<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Refdb(Box::new(err))
    }

    pub(crate) fn odb<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Odb(Box::new(err))
    }

    pub(crate) fn fetchhead<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::FetchHead(Box::new(err))
    }
}

/// The local repository, as seen by remote operations.
///
/// Every operation that reads or writes local state takes a context. The
/// context is borrowed for the duration of a single call, which doubles
/// as the configuration snapshot of the underlying store.
pub trait Context: config::ConfigRead + refdb::Refdb + odb::Odb + fetchhead::FetchHead {}

impl<T: config::ConfigRead + refdb::Refdb + odb::Odb + fetchhead::FetchHead> Context for T {}

/// The empty context of a repository-less remote.
///
/// Detached remotes can connect and list the peer advertisement, but are
/// refused any operation that would persist state. This context holds
/// nothing and is never written to.
#[derive(Clone, Copy, Debug, Default)]
pub struct Detached;

impl config::ConfigRead for Detached {
    type Error = Infallible;

    fn string(&self, _key: &str) -> Result<Option<String>, Self::Error> {
        Ok(None)
    }

    fn boolean(&self, _key: &str) -> Result<Option<bool>, Self::Error> {
        Ok(None)
    }

    fn multivar(&self, _key: &str) -> Result<Vec<String>, Self::Error> {
        Ok(Vec::new())
    }

    fn entries(&self, _glob: &str) -> Result<Vec<(String, String)>, Self::Error> {
        Ok(Vec::new())
    }
}

impl refdb::Refdb for Detached {
    type Error = Infallible;

    fn find(&self, _name: &RefStr) -> Result<Option<Either<Oid, RefString>>, Self::Error> {
        Ok(None)
    }

    fn refname_to_id(&self, _name: &RefStr) -> Result<Option<Oid>, Self::Error> {
        Ok(None)
    }

    fn references_glob(
        &self,
        _pattern: &PatternStr,
    ) -> Result<Vec<(RefString, Either<Oid, RefString>)>, Self::Error> {
        Ok(Vec::new())
    }

    fn set(&mut self, _name: &RefStr, _target: Oid, _log: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_symbolic(
        &mut self,
        _name: &RefStr,
        _target: &RefStr,
        _log: &str,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn compare_and_set(
        &mut self,
        _name: &RefStr,
        _expected: Option<Oid>,
        _target: Oid,
        _log: &str,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    fn rename(&mut self, _old: &RefStr, _new: &RefStr, _log: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    fn delete(&mut self, _name: &RefStr) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl odb::Odb for Detached {
    type Error = Infallible;

    fn contains(&self, _oid: Oid) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

impl fetchhead::FetchHead for Detached {
    type Error = Infallible;

    fn write_fetch_head(&mut self, _entries: &[fetchhead::Entry]) -> Result<(), Self::Error> {
        Ok(())
    }
}
