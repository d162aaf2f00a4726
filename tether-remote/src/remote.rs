//! The [`Remote`] entity and its operations.
//!
//! A remote is either *named* (bound to `remote.<name>.*` configuration),
//! *anonymous* (an ad-hoc URL inside a repository) or *detached* (a bare
//! URL with no repository at all). It is mutated by exactly one operation
//! at a time: a remote whose continuation stack is non-empty is *busy*,
//! and every public entry point refuses to start a second operation.
//!
//! Operations that touch local state take a [`Context`] (the
//! repository's configuration, reference and object stores), borrowed
//! for the duration of the call.

use std::collections::BTreeSet;

use bitflags::bitflags;
use either::Either;
use git_ref_format::refspec::PatternString;
use git_ref_format::RefString;

use crate::callbacks::{Callbacks, Discard};
use crate::config::{self, ConfigRead, ConfigWrite};
use crate::engine::{Advance, Events, Frame, Poll, Stack};
use crate::fetch::{self, FetchOp, FetchOptions, TagPolicy, TransferProgress};
use crate::push::{PushOp, PushOptions};
use crate::refdb::Refdb;
use crate::refspec::{self, Refspec};
use crate::tips;
use crate::transport::{self, Proxy, RemoteHead, Transport};
use crate::{io, Context, Detached, Direction, Error};

bitflags! {
    /// Flags accepted by [`Remote::create_with_opts`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// Do not apply the configured `url.*.insteadof` rewrites.
        const SKIP_INSTEADOF = 1 << 0;
        /// Do not install the default fetch refspec.
        const SKIP_DEFAULT_FETCHSPEC = 1 << 1;
    }
}

/// Options accepted by [`Remote::create_with_opts`].
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Persist the remote under this name. Requires a configuration
    /// store to write to.
    pub name: Option<String>,
    /// Install this fetch refspec instead of the default one.
    pub fetchspec: Option<String>,
    pub flags: CreateFlags,
}

/// Options accepted by [`Remote::connect`].
pub struct ConnectOptions {
    pub callbacks: Box<dyn Callbacks>,
    pub proxy: Proxy,
    pub custom_headers: Vec<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            callbacks: Box::new(Discard),
            proxy: Proxy::default(),
            custom_headers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Binding {
    Named(String),
    Anonymous,
    Detached,
}

/// A peer repository to fetch from or push to.
pub struct Remote {
    binding: Binding,
    pub(crate) url: Option<String>,
    pub(crate) push_url: Option<String>,
    /// The configured refspecs, fetch and push alike. The canonical
    /// source the derived sets are rebuilt from.
    pub(crate) refspecs: Vec<Refspec>,
    pub(crate) active_refspecs: Vec<Refspec>,
    pub(crate) passive_refspecs: Vec<Refspec>,
    /// The last-observed peer advertisement.
    pub(crate) refs: Vec<RemoteHead>,
    pub(crate) download_tags: TagPolicy,
    pub(crate) prune_refs: bool,
    /// Proxy resolved from configuration and environment at lookup time;
    /// used when the caller selects [`Proxy::Auto`].
    pub(crate) config_proxy: Option<String>,
    pub(crate) transport: Option<Box<dyn Transport>>,
    /// Holds the transport while its connect is suspended; never
    /// populated at the same time as `transport` for one connection.
    pub(crate) connect_transport: Option<Box<dyn Transport>>,
    pub(crate) callbacks: Box<dyn Callbacks>,
    pub(crate) proxy: Proxy,
    pub(crate) headers: Vec<String>,
    pub(crate) stack: Stack,
    pub(crate) stats: TransferProgress,
    /// Whether the current fetch used caller-provided refspecs; gates
    /// opportunistic updates.
    pub(crate) passed_refspecs: bool,
    pub(crate) requested: Vec<Refspec>,
    pub(crate) reflog_message: Option<String>,
}

impl Remote {
    fn new(binding: Binding, url: Option<String>, push_url: Option<String>) -> Self {
        Self {
            binding,
            url,
            push_url,
            refspecs: Vec::new(),
            active_refspecs: Vec::new(),
            passive_refspecs: Vec::new(),
            refs: Vec::new(),
            download_tags: TagPolicy::Auto,
            prune_refs: false,
            config_proxy: None,
            transport: None,
            connect_transport: None,
            callbacks: Box::new(Discard),
            proxy: Proxy::default(),
            headers: Vec::new(),
            stack: Stack::default(),
            stats: TransferProgress::default(),
            passed_refspecs: false,
            requested: Vec::new(),
            reflog_message: None,
        }
    }

    /// Load a configured remote.
    pub fn lookup<C: ConfigRead>(cx: &C, name: &str) -> Result<Self, Error> {
        Self::lookup_with(cx, name, true)
    }

    fn lookup_with<C: ConfigRead>(cx: &C, name: &str, insteadof: bool) -> Result<Self, Error> {
        config::validate_remote_name(name)?;
        let cfg = config::load(cx, name)?;
        if !cfg.found {
            return Err(Error::NotFound(name.to_owned()));
        }
        let (url, push_url) = rewrite_urls(cx, cfg.url, cfg.push_url, insteadof)?;
        let mut remote = Self::new(Binding::Named(name.to_owned()), url, push_url);
        remote.refspecs = cfg.refspecs;
        remote.download_tags = cfg.tags;
        remote.prune_refs = cfg.prune;
        remote.config_proxy = cfg.proxy;
        Ok(remote)
    }

    /// Create a named remote with the default fetch refspec and persist
    /// it.
    pub fn create<C: ConfigWrite>(cx: &mut C, name: &str, url: &str) -> Result<Self, Error> {
        Self::create_with_opts(
            Some(cx),
            url,
            &CreateOptions {
                name: Some(name.to_owned()),
                ..CreateOptions::default()
            },
        )
    }

    /// Create a remote from a URL. Depending on the options, the remote
    /// is persisted under a name, bound to the repository anonymously,
    /// or fully detached (no context given).
    pub fn create_with_opts<C: ConfigWrite>(
        cx: Option<&mut C>,
        url: &str,
        opts: &CreateOptions,
    ) -> Result<Self, Error> {
        let url = config::canonicalize_url(url)?;
        let insteadof = !opts.flags.contains(CreateFlags::SKIP_INSTEADOF);

        match (&opts.name, cx) {
            (Some(name), Some(cx)) => {
                config::validate_remote_name(name)?;
                if config::load(cx, name)?.found {
                    return Err(Error::Exists(name.clone()));
                }
                let fetchspec = match &opts.fetchspec {
                    Some(spec) => {
                        Refspec::parse(spec, Direction::Fetch)?;
                        Some(spec.clone())
                    }
                    None if opts.flags.contains(CreateFlags::SKIP_DEFAULT_FETCHSPEC) => None,
                    None => Some(Refspec::default_fetch(name)?.raw().to_owned()),
                };
                cx.set(&config::key(name, "url"), &url)
                    .map_err(Error::config)?;
                if let Some(spec) = fetchspec {
                    cx.add(&config::key(name, "fetch"), &spec)
                        .map_err(Error::config)?;
                }
                Self::lookup_with(cx, name, insteadof)
            }
            (Some(_), None) => Err(Error::Invalid(
                "a repository is required to create a named remote".to_owned(),
            )),
            (None, Some(cx)) => {
                let (url, push_url) = rewrite_urls(cx, Some(url), None, insteadof)?;
                Ok(Self::new(Binding::Anonymous, url, push_url))
            }
            (None, None) => Ok(Self::new(Binding::Detached, Some(url), None)),
        }
    }

    /// Create an in-memory remote bound to a repository but not to any
    /// configuration.
    pub fn create_anonymous<C: ConfigRead>(cx: &C, url: &str) -> Result<Self, Error> {
        let url = config::canonicalize_url(url)?;
        let (url, push_url) = rewrite_urls(cx, Some(url), None, true)?;
        Ok(Self::new(Binding::Anonymous, url, push_url))
    }

    /// Create a remote with no repository at all. Detached remotes can
    /// connect and list, but refuse anything that persists state.
    pub fn create_detached(url: &str) -> Result<Self, Error> {
        let url = config::canonicalize_url(url)?;
        Ok(Self::new(Binding::Detached, Some(url), None))
    }

    /// Copy the configuration-derived state of this remote. Connection
    /// and operation state is not copied.
    pub fn dup(&self) -> Self {
        let mut remote = Self::new(
            self.binding.clone(),
            self.url.clone(),
            self.push_url.clone(),
        );
        remote.refspecs = self.refspecs.clone();
        remote.download_tags = self.download_tags;
        remote.prune_refs = self.prune_refs;
        remote.config_proxy = self.config_proxy.clone();
        remote
    }

    pub fn name(&self) -> Option<&str> {
        match &self.binding {
            Binding::Named(name) => Some(name),
            Binding::Anonymous | Binding::Detached => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn pushurl(&self) -> Option<&str> {
        self.push_url.as_deref()
    }

    pub fn refspecs(&self) -> &[Refspec] {
        &self.refspecs
    }

    pub fn stats(&self) -> &TransferProgress {
        &self.stats
    }

    pub fn download_tags(&self) -> TagPolicy {
        self.download_tags
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_connected())
    }

    /// Set (or, with `None`, delete) the fetch URL of a configured
    /// remote.
    pub fn set_url<C: ConfigWrite>(cx: &mut C, name: &str, url: Option<&str>) -> Result<(), Error> {
        set_url_field(cx, name, "url", url)
    }

    /// Set (or, with `None`, delete) the push URL of a configured
    /// remote.
    pub fn set_pushurl<C: ConfigWrite>(
        cx: &mut C,
        name: &str,
        url: Option<&str>,
    ) -> Result<(), Error> {
        set_url_field(cx, name, "pushurl", url)
    }

    /// Append a fetch refspec to a configured remote.
    pub fn add_fetch<C: ConfigWrite>(cx: &mut C, name: &str, spec: &str) -> Result<(), Error> {
        config::validate_remote_name(name)?;
        Refspec::parse(spec, Direction::Fetch)?;
        cx.add(&config::key(name, "fetch"), spec)
            .map_err(Error::config)
    }

    /// Append a push refspec to a configured remote.
    pub fn add_push<C: ConfigWrite>(cx: &mut C, name: &str, spec: &str) -> Result<(), Error> {
        config::validate_remote_name(name)?;
        Refspec::parse(spec, Direction::Push)?;
        cx.add(&config::key(name, "push"), spec)
            .map_err(Error::config)
    }

    /// All configured remote names, sorted.
    pub fn list<C: ConfigRead>(cx: &C) -> Result<Vec<String>, Error> {
        let mut names = BTreeSet::new();
        for (key, _) in cx.entries("remote.*").map_err(Error::config)? {
            let Some(rest) = key.strip_prefix("remote.") else {
                continue;
            };
            let Some((name, _)) = rest.rsplit_once('.') else {
                continue;
            };
            if !name.is_empty() {
                names.insert(name.to_owned());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Rename a configured remote.
    ///
    /// The configuration section, `branch.*.remote` bindings and the
    /// `refs/remotes/<old>/` namespace (including symref targets inside
    /// it) move to the new name; fetch refspecs equal to the default for
    /// `old` are migrated. Any other fetch refspec is left untouched and
    /// returned for the caller to reconcile.
    pub fn rename<C: ConfigWrite + Refdb>(
        cx: &mut C,
        old: &str,
        new: &str,
    ) -> Result<Vec<String>, Error> {
        config::validate_remote_name(old)?;
        config::validate_remote_name(new)?;
        if !config::load(cx, old)?.found {
            return Err(Error::NotFound(old.to_owned()));
        }
        if config::load(cx, new)?.found {
            return Err(Error::Exists(new.to_owned()));
        }

        cx.rename_section(&format!("remote.{old}"), &format!("remote.{new}"))
            .map_err(Error::config)?;

        for (key, value) in cx.entries("branch.*.remote").map_err(Error::config)? {
            if value == old {
                ConfigWrite::set(cx, &key, new).map_err(Error::config)?;
            }
        }

        let log = format!("remote: renamed {old} to {new}");
        let old_namespace = format!("refs/remotes/{old}/");
        let new_namespace = format!("refs/remotes/{new}/");
        let glob = PatternString::try_from(format!("refs/remotes/{old}/*"))
            .map_err(|_| Error::InvalidName(old.to_owned()))?;
        for (name, target) in cx.references_glob(&glob).map_err(Error::refdb)? {
            let Some(suffix) = name.as_str().strip_prefix(&old_namespace) else {
                continue;
            };
            let Ok(renamed) = RefString::try_from(format!("{new_namespace}{suffix}")) else {
                continue;
            };
            cx.rename(&name, &renamed, &log).map_err(Error::refdb)?;
            if let Either::Right(symref) = &target {
                if let Some(pointee) = symref.as_str().strip_prefix(&old_namespace) {
                    if let Ok(rewritten) = RefString::try_from(format!("{new_namespace}{pointee}"))
                    {
                        cx.set_symbolic(&renamed, &rewritten, &log)
                            .map_err(Error::refdb)?;
                    }
                }
            }
        }

        let fetch_key = config::key(new, "fetch");
        let specs = cx.multivar(&fetch_key).map_err(Error::config)?;
        let default_old = Refspec::default_fetch(old)?.raw().to_owned();
        let default_new = Refspec::default_fetch(new)?.raw().to_owned();
        let mut problems = Vec::new();
        if !specs.is_empty() {
            cx.unset_all(&fetch_key).map_err(Error::config)?;
            for spec in specs {
                if spec == default_old {
                    cx.add(&fetch_key, &default_new).map_err(Error::config)?;
                } else {
                    problems.push(spec.clone());
                    cx.add(&fetch_key, &spec).map_err(Error::config)?;
                }
            }
        }
        Ok(problems)
    }

    /// Delete a configured remote: its branch bindings, every local ref
    /// matching one of its fetch destinations, and the configuration
    /// section.
    pub fn delete<C: ConfigWrite + Refdb>(cx: &mut C, name: &str) -> Result<(), Error> {
        config::validate_remote_name(name)?;
        let cfg = config::load(cx, name)?;
        if !cfg.found {
            return Err(Error::NotFound(name.to_owned()));
        }

        for (key, value) in cx.entries("branch.*.remote").map_err(Error::config)? {
            if value != name {
                continue;
            }
            cx.unset(&key).map_err(Error::config)?;
            if let Some(prefix) = key.strip_suffix(".remote") {
                cx.unset(&format!("{prefix}.merge")).map_err(Error::config)?;
            }
        }

        for spec in &cfg.refspecs {
            if spec.direction() != Direction::Fetch {
                continue;
            }
            let Some(dst) = spec.dst() else {
                continue;
            };
            for (name, _) in cx.references_glob(dst).map_err(Error::refdb)? {
                cx.delete(&name).map_err(Error::refdb)?;
            }
        }

        cx.remove_section(&format!("remote.{name}"))
            .map_err(Error::config)
    }

    /// Open a connection to the peer.
    ///
    /// In cooperative mode this may return [`Poll::Pending`]; resume
    /// with [`Remote::perform`]. The connection is kept until
    /// [`Remote::disconnect`], an operation tears it down, or the remote
    /// is dropped.
    pub fn connect(&mut self, direction: Direction, opts: ConnectOptions) -> Result<Poll<()>, Error> {
        self.ensure_idle()?;
        if self.is_connected() {
            return Err(Error::Busy);
        }
        self.callbacks = opts.callbacks;
        self.proxy = opts.proxy;
        self.headers = opts.custom_headers;

        let frame = match self.prepare_connect(direction) {
            Ok(frame) => frame,
            Err(err) => {
                self.reset_after_error();
                return Err(err);
            }
        };
        if let Err(err) = self.stack.push(frame) {
            self.reset_after_error();
            return Err(err);
        }
        self.drive(&mut Detached, Events::empty())
    }

    /// The peer advertisement. Requires an established connection.
    pub fn ls(&self) -> Result<&[RemoteHead], Error> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(transport::Error::NotConnected)?;
        Ok(transport.ls()?)
    }

    /// Fetch from the peer: connect, negotiate, download, reconcile
    /// references, prune if enabled, and disconnect.
    ///
    /// `refspecs` overrides the configured fetch refspecs for this call;
    /// the configured set then still drives opportunistic
    /// remote-tracking updates.
    pub fn fetch<C: Context>(
        &mut self,
        cx: &mut C,
        refspecs: &[&str],
        opts: FetchOptions,
        reflog_message: Option<&str>,
    ) -> Result<Poll<()>, Error> {
        self.begin_fetch(cx, refspecs, opts, reflog_message, false)
    }

    /// Negotiate and download the pack, leaving the connection open and
    /// reference reconciliation to the caller.
    pub fn download<C: Context>(
        &mut self,
        cx: &mut C,
        refspecs: &[&str],
        opts: FetchOptions,
    ) -> Result<Poll<()>, Error> {
        self.begin_fetch(cx, refspecs, opts, None, true)
    }

    fn begin_fetch<C: Context>(
        &mut self,
        cx: &mut C,
        refspecs: &[&str],
        opts: FetchOptions,
        reflog_message: Option<&str>,
        transfer_only: bool,
    ) -> Result<Poll<()>, Error> {
        self.ensure_idle()?;
        self.ensure_attached("fetch")?;
        let mut requested = Vec::with_capacity(refspecs.len());
        for spec in refspecs {
            requested.push(Refspec::parse(spec, Direction::Fetch)?);
        }
        let FetchOptions {
            callbacks,
            prune,
            update_fetchhead,
            download_tags,
            proxy,
            custom_headers,
        } = opts;
        self.callbacks = callbacks;
        self.proxy = proxy;
        self.headers = custom_headers;
        self.requested = requested;
        self.reflog_message = reflog_message.map(ToOwned::to_owned);

        let tags = match download_tags {
            TagPolicy::Unspecified => self.download_tags,
            tags => tags,
        };
        let plan = fetch::Plan {
            prune,
            update_fetchhead,
            tags,
            transfer_only,
        };
        if let Err(err) = self.stack.push(Frame::Fetch(FetchOp::new(plan))) {
            self.reset_after_error();
            return Err(err);
        }
        log::debug!(target: "fetch", "Fetching from {:?}", self.url.as_deref().unwrap_or_default());
        self.drive(cx, Events::empty())
    }

    /// Push to the peer: connect, upload, report per-reference verdicts,
    /// update local tracking branches, and disconnect.
    pub fn push<C: Context>(
        &mut self,
        cx: &mut C,
        refspecs: &[&str],
        opts: PushOptions,
    ) -> Result<Poll<()>, Error> {
        self.begin_push(cx, refspecs, opts, false)
    }

    /// Upload to the peer, leaving the connection open and tracking
    /// updates to the caller.
    pub fn upload<C: Context>(
        &mut self,
        cx: &mut C,
        refspecs: &[&str],
        opts: PushOptions,
    ) -> Result<Poll<()>, Error> {
        self.begin_push(cx, refspecs, opts, true)
    }

    fn begin_push<C: Context>(
        &mut self,
        cx: &mut C,
        refspecs: &[&str],
        opts: PushOptions,
        transfer_only: bool,
    ) -> Result<Poll<()>, Error> {
        self.ensure_idle()?;
        self.ensure_attached("push")?;
        let mut requested = Vec::with_capacity(refspecs.len());
        for spec in refspecs {
            requested.push(Refspec::parse(spec, Direction::Push)?);
        }
        let PushOptions {
            callbacks,
            pb_parallelism: _,
            proxy,
            custom_headers,
        } = opts;
        self.callbacks = callbacks;
        self.proxy = proxy;
        self.headers = custom_headers;
        self.requested = requested;

        if let Err(err) = self.stack.push(Frame::Push(PushOp::new(transfer_only))) {
            self.reset_after_error();
            return Err(err);
        }
        log::debug!(target: "push", "Pushing to {:?}", self.push_url.as_deref().or(self.url.as_deref()).unwrap_or_default());
        self.drive(cx, Events::empty())
    }

    /// Reconcile local references with the last-observed advertisement.
    /// Runs as part of [`Remote::fetch`]; exposed for callers driving
    /// [`Remote::download`] themselves.
    pub fn update_tips<C: Context>(
        &mut self,
        cx: &mut C,
        callbacks: Option<Box<dyn Callbacks>>,
        update_fetchhead: bool,
        tags: TagPolicy,
        reflog_message: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_attached("update tips")?;
        if let Some(callbacks) = callbacks {
            self.callbacks = callbacks;
        }
        if let Some(message) = reflog_message {
            self.reflog_message = Some(message.to_owned());
        }
        self.apply_update_tips(cx, tags, update_fetchhead)
    }

    /// Delete remote-tracking refs whose peer-side counterpart is no
    /// longer advertised.
    pub fn prune<C: Context>(
        &mut self,
        cx: &mut C,
        callbacks: Option<Box<dyn Callbacks>>,
    ) -> Result<(), Error> {
        self.ensure_attached("prune")?;
        if let Some(callbacks) = callbacks {
            self.callbacks = callbacks;
        }
        self.apply_prune(cx)
    }

    /// The branch the peer considers current.
    pub fn default_branch(&self) -> Result<RefString, Error> {
        tips::default_branch(&self.refs)
    }

    /// Close the connection. Blocks if the transport needs to flush.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.ensure_idle()?;
        self.connect_transport = None;
        if let Some(mut transport) = self.transport.take() {
            let mut events = Events::empty();
            loop {
                match transport.close(events)? {
                    Poll::Ready(()) => break,
                    Poll::Pending(readiness) => {
                        events = io::wait(readiness)
                            .map_err(|err| Error::Transport(transport::Error::Io(err)))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Ask the in-flight operation to stop. The cancellation surfaces as
    /// a transport error on the next re-entry, unwinding normally.
    pub fn stop(&self) {
        if let Some(transport) = &self.transport {
            transport.cancel();
        }
        if let Some(transport) = &self.connect_transport {
            transport.cancel();
        }
    }

    /// Resume a suspended operation with the observed readiness events.
    ///
    /// Fails with *invalid* if no operation is in progress.
    pub fn perform<C: Context>(&mut self, cx: &mut C, events: Events) -> Result<Poll<()>, Error> {
        if self.stack.is_empty() {
            return Err(Error::Invalid(
                "remote is idle: no operation to resume".to_owned(),
            ));
        }
        self.drive(cx, events)
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        if self.stack.is_empty() {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    fn ensure_attached(&self, what: &str) -> Result<(), Error> {
        match self.binding {
            Binding::Detached => Err(Error::Invalid(format!(
                "cannot {what} with a detached remote"
            ))),
            Binding::Named(_) | Binding::Anonymous => Ok(()),
        }
    }

    fn is_detached(&self) -> bool {
        matches!(self.binding, Binding::Detached)
    }

    fn url_for_direction(&self, direction: Direction) -> Result<&str, Error> {
        let url = match direction {
            Direction::Fetch => self.url.as_deref(),
            Direction::Push => self.push_url.as_deref().or(self.url.as_deref()),
        };
        url.ok_or_else(|| Error::Invalid("remote has no URL for this direction".to_owned()))
    }

    /// Resolve the URL, select a transport and stage the connect frame.
    pub(crate) fn prepare_connect(&mut self, direction: Direction) -> Result<Frame, Error> {
        let url = self.url_for_direction(direction)?.to_owned();
        let url = self.callbacks.resolve_url(&url, direction).unwrap_or(url);

        let mut transport = match self.transport.take() {
            Some(transport) => transport,
            None => match self.callbacks.transport(&url) {
                Some(transport) => transport,
                None => transport::registry()
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .resolve(&url)?,
            },
        };
        let proxy = match &self.proxy {
            Proxy::Auto => self
                .config_proxy
                .clone()
                .map(Proxy::Specified)
                .unwrap_or(Proxy::None),
            proxy => proxy.clone(),
        };
        transport.configure(&proxy, &self.headers)?;
        self.transport = Some(transport);
        log::debug!(target: "remote", "Connecting to {:?} ({:?})", url, direction);
        Ok(Frame::Connect(ConnectOp::new(url, direction)))
    }

    pub(crate) fn snapshot_refs(&mut self) -> Result<(), Error> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(transport::Error::NotConnected)?;
        self.refs = transport.ls()?.to_vec();
        Ok(())
    }

    /// Rebuild the derived refspec sets from the configured (or
    /// caller-supplied) list and the current advertisement.
    pub(crate) fn rebuild_refspecs(&mut self) {
        let configured: Vec<Refspec> = self
            .refspecs
            .iter()
            .filter(|spec| spec.direction() == Direction::Fetch)
            .cloned()
            .collect();
        self.passive_refspecs = refspec::expand(&configured, &self.refs);
        self.passed_refspecs = !self.requested.is_empty();
        self.active_refspecs = if self.passed_refspecs {
            refspec::expand(&self.requested, &self.refs)
        } else {
            self.passive_refspecs.clone()
        };
    }

    pub(crate) fn rebuild_refspecs_for_push(&mut self) {
        let configured_fetch: Vec<Refspec> = self
            .refspecs
            .iter()
            .filter(|spec| spec.direction() == Direction::Fetch)
            .cloned()
            .collect();
        self.passive_refspecs = refspec::expand(&configured_fetch, &self.refs);
        self.passed_refspecs = !self.requested.is_empty();
        let base: Vec<Refspec> = if self.passed_refspecs {
            self.requested.clone()
        } else {
            self.refspecs
                .iter()
                .filter(|spec| spec.direction() == Direction::Push)
                .cloned()
                .collect()
        };
        self.active_refspecs = refspec::expand(&base, &self.refs);
    }

    pub(crate) fn apply_update_tips<C: Context>(
        &mut self,
        cx: &mut C,
        tags: TagPolicy,
        update_fetchhead: bool,
    ) -> Result<(), Error> {
        let driving: Vec<Refspec> = if self.passed_refspecs {
            self.requested.clone()
        } else {
            self.refspecs
                .iter()
                .filter(|spec| spec.direction() == Direction::Fetch)
                .cloned()
                .collect()
        };
        let message = self
            .reflog_message
            .clone()
            .unwrap_or_else(|| "fetch".to_owned());
        let tags = match tags {
            TagPolicy::Unspecified => self.download_tags,
            tags => tags,
        };
        let update_fetchhead = update_fetchhead && !self.is_detached();

        let callbacks = self.callbacks.as_mut();
        let pass = tips::UpdateTips {
            refs: &self.refs,
            specs: &driving,
            passive: &self.passive_refspecs,
            passed: self.passed_refspecs,
            url: self.url.as_deref(),
            name: match &self.binding {
                Binding::Named(name) => Some(name.as_str()),
                Binding::Anonymous | Binding::Detached => None,
            },
            tags,
            update_fetchhead,
            message: &message,
        };
        pass.run(cx, callbacks)
    }

    pub(crate) fn apply_prune<C: Context>(&mut self, cx: &mut C) -> Result<(), Error> {
        let specs: Vec<Refspec> = self
            .refspecs
            .iter()
            .filter(|spec| spec.direction() == Direction::Fetch)
            .cloned()
            .collect();
        tips::prune(cx, self.callbacks.as_mut(), &self.refs, &specs)
    }

    /// Drop the per-call scratch once an operation has fully completed.
    pub(crate) fn release_scratch(&mut self) {
        self.requested.clear();
        self.reflog_message = None;
        self.passed_refspecs = false;
    }

    /// Unwind after a terminal failure: the stack, the transports and
    /// all call-scoped state go; the remote is idle and reusable.
    fn reset_after_error(&mut self) {
        self.stack.clear();
        self.transport = None;
        self.connect_transport = None;
        self.callbacks = Box::new(Discard);
        self.proxy = Proxy::default();
        self.headers.clear();
        self.release_scratch();
    }

    /// Advance the continuation stack until it suspends, completes or
    /// fails.
    fn step<C: Context>(&mut self, cx: &mut C, mut events: Events) -> Result<Poll<()>, Error> {
        loop {
            if events.contains(Events::TIMEOUT) {
                self.reset_after_error();
                return Err(Error::Transport(transport::Error::TimedOut));
            }
            let Some(mut frame) = self.stack.pop() else {
                return Ok(Poll::Ready(()));
            };
            match frame.advance(self, cx, events) {
                Ok(Advance::Pending(readiness)) => {
                    if let Err(err) = self.stack.push(frame) {
                        self.reset_after_error();
                        return Err(err);
                    }
                    return Ok(Poll::Pending(readiness));
                }
                Ok(Advance::Spawn(child)) => {
                    let pushed = self.stack.push(frame).and_then(|()| self.stack.push(child));
                    if let Err(err) = pushed {
                        self.reset_after_error();
                        return Err(err);
                    }
                    events = Events::empty();
                }
                Ok(Advance::Over) => {
                    events = Events::empty();
                }
                Err(err) => {
                    self.reset_after_error();
                    return Err(err);
                }
            }
        }
    }

    /// Drive a staged operation: cooperative callers get the readiness
    /// request forwarded to their sink; everyone else blocks on the
    /// descriptor right here.
    fn drive<C: Context>(&mut self, cx: &mut C, events: Events) -> Result<Poll<()>, Error> {
        let mut poll = self.step(cx, events)?;
        loop {
            match poll {
                Poll::Ready(()) => return Ok(Poll::Ready(())),
                Poll::Pending(readiness) => {
                    if let Some(sink) = self.callbacks.readiness() {
                        sink.set_fd_events(readiness.fd, readiness.interest, readiness.timeout);
                        return Ok(Poll::Pending(readiness));
                    }
                    let events = match io::wait(readiness) {
                        Ok(events) => events,
                        Err(err) => {
                            self.reset_after_error();
                            return Err(Error::Transport(transport::Error::Io(err)));
                        }
                    };
                    poll = self.step(cx, events)?;
                }
            }
        }
    }
}

/// The resumable connect stage. While suspended, the transport lives in
/// the remote's `connect_transport` slot; completion promotes it back.
pub(crate) struct ConnectOp {
    url: String,
    direction: Direction,
}

impl ConnectOp {
    pub(crate) fn new(url: String, direction: Direction) -> Self {
        Self { url, direction }
    }

    pub(crate) fn advance(&mut self, remote: &mut Remote, events: Events) -> Result<Advance, Error> {
        let mut transport = remote
            .transport
            .take()
            .or_else(|| remote.connect_transport.take())
            .ok_or(transport::Error::NotConnected)?;
        match transport.connect(&self.url, self.direction, events, remote.callbacks.as_mut()) {
            Ok(Poll::Ready(())) => {
                remote.transport = Some(transport);
                Ok(Advance::Over)
            }
            Ok(Poll::Pending(readiness)) => {
                remote.connect_transport = Some(transport);
                Ok(Advance::Pending(readiness))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn set_url_field<C: ConfigWrite>(
    cx: &mut C,
    name: &str,
    field: &str,
    url: Option<&str>,
) -> Result<(), Error> {
    config::validate_remote_name(name)?;
    let key = config::key(name, field);
    match url {
        Some(url) => {
            let url = config::canonicalize_url(url)?;
            cx.set(&key, &url).map_err(Error::config)
        }
        None => cx.unset(&key).map_err(Error::config),
    }
}

fn rewrite_urls<C: ConfigRead>(
    cx: &C,
    url: Option<String>,
    push_url: Option<String>,
    insteadof: bool,
) -> Result<(Option<String>, Option<String>), Error> {
    if !insteadof {
        return Ok((url, push_url));
    }
    let rewritten = match &url {
        Some(url) => Some(config::apply_insteadof(cx, url, Direction::Fetch)?),
        None => None,
    };
    let push = match push_url {
        Some(push_url) => Some(config::apply_insteadof(cx, &push_url, Direction::Fetch)?),
        None => match &url {
            // No explicit push URL: a `pushinsteadof` rewrite of the
            // fetch URL, if one applies, becomes the push URL.
            Some(url) => {
                let rewritten = config::apply_insteadof(cx, url, Direction::Push)?;
                (&rewritten != url).then_some(rewritten)
            }
            None => None,
        },
    };
    Ok((rewritten, push))
}
