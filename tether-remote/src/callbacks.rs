//! The caller-supplied hook surface.
//!
//! All hooks default to passing through: returning `None` (or doing
//! nothing) leaves the built-in behavior unchanged. Callbacks are copied
//! into the [`crate::Remote`] at the start of an operation and live there
//! until the operation completes or the next one installs its own.

use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;
use git_ref_format::RefStr;

use crate::engine::Events;
use crate::fetch::TransferProgress;
use crate::transport::Transport;
use crate::{Direction, Oid};

bitflags! {
    /// The credential kinds a transport is willing to accept.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CredentialType: u32 {
        const USERPASS_PLAINTEXT = 1 << 0;
        const SSH_KEY = 1 << 1;
        const TOKEN = 1 << 2;
        const DEFAULT = 1 << 3;
    }
}

/// A credential produced by the caller.
#[derive(Clone, Debug)]
pub enum Credential {
    UserPassPlaintext { username: String, password: String },
    SshKey {
        username: String,
        private_key: std::path::PathBuf,
        passphrase: Option<String>,
    },
    Token(String),
    /// Whatever ambient mechanism the transport has (agent, keychain).
    Default,
}

/// An opaque peer certificate, handed to the caller for inspection.
#[derive(Clone, Debug)]
pub struct Certificate {
    pub kind: CertificateKind,
    /// Raw certificate material, in whatever encoding the transport
    /// received it.
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateKind {
    X509,
    SshHostKey,
}

/// The caller's verdict on a peer certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateCheck {
    Accept,
    Reject,
}

/// Receives the readiness request of a suspended operation.
///
/// Implementing this (by returning it from [`Callbacks::readiness`])
/// switches the engine into cooperative mode: instead of blocking, the
/// operation returns [`crate::Poll::Pending`] after handing the watched
/// descriptor to the sink, and is resumed via [`crate::Remote::perform`].
pub trait ReadinessSink {
    fn set_fd_events(&mut self, fd: RawFd, interest: Events, timeout: Option<Duration>);
}

/// The hook set consulted during remote operations.
pub trait Callbacks {
    /// Produce a credential for `url`. `None` falls back to anonymous
    /// access (the transport may then fail with an authentication error).
    fn credentials(
        &mut self,
        url: &str,
        username_from_url: Option<&str>,
        allowed: CredentialType,
    ) -> Option<Credential> {
        let _ = (url, username_from_url, allowed);
        None
    }

    /// Decide the fate of a peer certificate. `None` keeps the
    /// transport's own verdict (`valid`).
    fn certificate_check(
        &mut self,
        cert: &Certificate,
        valid: bool,
        host: &str,
    ) -> Option<CertificateCheck> {
        let _ = (cert, valid, host);
        None
    }

    /// Textual progress forwarded from the peer's sideband channel.
    fn sideband_progress(&mut self, data: &[u8]) {
        let _ = data;
    }

    /// Indexer progress while a pack is being downloaded.
    fn transfer_progress(&mut self, progress: &TransferProgress) {
        let _ = progress;
    }

    /// Provide the transport for `url`, overriding the registry.
    fn transport(&mut self, url: &str) -> Option<Box<dyn Transport>> {
        let _ = url;
        None
    }

    /// Final chance to rewrite the URL before a transport is selected.
    fn resolve_url(&mut self, url: &str, direction: Direction) -> Option<String> {
        let _ = (url, direction);
        None
    }

    /// A local reference changed as the result of a fetch or push.
    /// Deletions carry the zero oid as `new`.
    fn update_tips(&mut self, name: &RefStr, old: Oid, new: Oid) {
        let _ = (name, old, new);
    }

    /// The peer reported the outcome of a pushed reference. `status` is
    /// `None` on success, the peer's message otherwise.
    fn push_update_reference(&mut self, name: &str, status: Option<&str>) {
        let _ = (name, status);
    }

    /// The cooperative readiness sink. Returning `None` (the default)
    /// selects the synchronous driver, which blocks on the descriptor
    /// itself.
    fn readiness(&mut self) -> Option<&mut dyn ReadinessSink> {
        None
    }
}

/// Callbacks that leave every default in place.
#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl Callbacks for Discard {}
