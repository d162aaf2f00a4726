//! The wire transport seam.
//!
//! A [`Transport`] speaks one wire protocol (smart HTTP, SSH, local…)
//! and is obtained either from the caller's [`crate::Callbacks::transport`]
//! factory or from a [`Registry`] keyed by URL scheme. The remote core
//! owns the transport exclusively for the lifetime of a connection and
//! never exposes it.
//!
//! Methods that perform network I/O are resumable: they may return
//! [`Poll::Pending`] with the descriptor readiness they are waiting for,
//! and are re-invoked with the observed [`Events`] until they return
//! [`Poll::Ready`]. A transport asked to [`Transport::cancel`] reports
//! [`Error::Canceled`] from whichever call is in flight next.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use thiserror::Error as ThisError;

use crate::callbacks::Callbacks;
use crate::engine::{Events, Poll};
use crate::fetch::{Negotiation, TransferProgress};
use crate::push::{PushStatus, PushUpdate};
use crate::{Direction, Oid};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("transport is not connected")]
    NotConnected,
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    TimedOut,
    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("authentication failed")]
    Auth,
    #[error("certificate rejected for host {0:?}")]
    Certificate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(String),
}

/// A reference advertised by the peer.
///
/// The name is kept exactly as received; validation happens when the
/// advertisement is reconciled with local storage, where malformed names
/// are skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteHead {
    pub name: String,
    pub oid: Oid,
    pub symref_target: Option<String>,
}

/// Proxy selection for a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Proxy {
    /// Connect directly.
    #[default]
    None,
    /// Use whatever the configuration and environment specify.
    Auto,
    /// Use this proxy URL.
    Specified(String),
}

/// A wire protocol implementation.
pub trait Transport {
    /// Install connection options. Called once, before
    /// [`Transport::connect`].
    fn configure(&mut self, proxy: &Proxy, headers: &[String]) -> Result<(), Error>;

    /// Establish the connection and perform the protocol handshake,
    /// including the reference advertisement.
    fn connect(
        &mut self,
        url: &str,
        direction: Direction,
        events: Events,
        callbacks: &mut dyn Callbacks,
    ) -> Result<Poll<()>, Error>;

    fn is_connected(&self) -> bool;

    /// The peer's reference advertisement. Requires an established
    /// connection.
    fn ls(&self) -> Result<&[RemoteHead], Error>;

    /// Tell the peer which objects we want and which we already have.
    fn negotiate(
        &mut self,
        negotiation: &Negotiation,
        events: Events,
        callbacks: &mut dyn Callbacks,
    ) -> Result<Poll<()>, Error>;

    /// Transfer the pack agreed upon during negotiation into the local
    /// object database, accumulating progress into `stats`.
    fn download(
        &mut self,
        events: Events,
        stats: &mut TransferProgress,
        callbacks: &mut dyn Callbacks,
    ) -> Result<Poll<()>, Error>;

    /// Upload objects and reference updates, returning the peer's
    /// per-reference verdicts.
    fn push(
        &mut self,
        updates: &[PushUpdate],
        events: Events,
        callbacks: &mut dyn Callbacks,
    ) -> Result<Poll<Vec<PushStatus>>, Error>;

    /// Ask the in-flight operation to stop. Safe to call from a signal
    /// handler iff the implementation's flag is.
    fn cancel(&self);

    /// Tear the connection down. May suspend to flush pending writes.
    fn close(&mut self, events: Events) -> Result<Poll<()>, Error>;
}

/// Transport constructor for one URL scheme.
pub type Factory = fn(url: &str) -> Result<Box<dyn Transport>, Error>;

/// Maps URL schemes to transport factories.
///
/// The remote core consults an explicit registry value; the process-wide
/// [`registry`] exists for callers that configure transports once at
/// startup.
#[derive(Default)]
pub struct Registry {
    schemes: HashMap<String, Factory>,
}

impl Registry {
    pub fn register(&mut self, scheme: &str, factory: Factory) {
        self.schemes.insert(scheme.to_owned(), factory);
    }

    pub fn resolve(&self, url: &str) -> Result<Box<dyn Transport>, Error> {
        let scheme = scheme(url);
        match self.schemes.get(scheme) {
            Some(factory) => factory(url),
            None => Err(Error::UnsupportedScheme(scheme.to_owned())),
        }
    }
}

/// The process-wide default registry. Empty until populated by the
/// embedding application.
pub fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));
    &REGISTRY
}

/// The scheme of a remote URL: an explicit `<scheme>://` prefix, the
/// `ssh` scp-like shorthand (`user@host:path`), or `file` for bare
/// paths.
pub fn scheme(url: &str) -> &str {
    if let Some((scheme, _)) = url.split_once("://") {
        return scheme;
    }
    match url.split_once(':') {
        Some((head, _)) if !head.contains('/') => "ssh",
        _ => "file",
    }
}
