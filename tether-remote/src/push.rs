//! The push pipeline.
//!
//! Stages, in order:
//!
//!   1. connect;
//!   2. upload: expand the push refspecs against the advertisement,
//!      resolve local sources, transfer the pack and the reference
//!      commands, and report the peer's per-reference verdicts;
//!   3. disconnect;
//!   4. update the local tracking branches through the configured
//!      fetch refspecs.

use git_ref_format::RefStr;

use crate::callbacks::{Callbacks, Discard};
use crate::engine::{Advance, Events, Poll};
use crate::refdb::Refdb;
use crate::remote::Remote;
use crate::tips;
use crate::transport::{self, Proxy};
use crate::{zero_oid, Context, Direction, Error, Oid};

/// Options of a single push.
pub struct PushOptions {
    pub callbacks: Box<dyn Callbacks>,
    /// Packbuilder parallelism; `0` selects the number of cores.
    pub pb_parallelism: usize,
    pub proxy: Proxy,
    pub custom_headers: Vec<String>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            callbacks: Box::new(Discard),
            pb_parallelism: 1,
            proxy: Proxy::default(),
            custom_headers: Vec::new(),
        }
    }
}

/// One reference command sent to the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushUpdate {
    /// The local source reference; empty for deletions.
    pub src: String,
    /// The peer-side reference to update.
    pub dst: String,
    /// The object the peer reference should point at afterwards; the
    /// zero oid deletes it.
    pub oid: Oid,
}

/// The peer's verdict on one pushed reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushStatus {
    /// The peer-side reference name.
    pub reference: String,
    /// `None` on success, the peer's rejection message otherwise.
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Connect,
    Upload,
    Disconnect,
    Update,
}

/// The resumable push operation.
pub(crate) struct PushOp {
    stage: Stage,
    /// Stop after the upload; used by the standalone `upload` operation.
    transfer_only: bool,
    spawned_connect: bool,
    updates: Vec<PushUpdate>,
    statuses: Vec<PushStatus>,
}

impl PushOp {
    pub(crate) fn new(transfer_only: bool) -> Self {
        Self {
            stage: Stage::Connect,
            transfer_only,
            spawned_connect: false,
            updates: Vec::new(),
            statuses: Vec::new(),
        }
    }

    pub(crate) fn advance<C: Context>(
        &mut self,
        remote: &mut Remote,
        cx: &mut C,
        mut events: Events,
    ) -> Result<Advance, Error> {
        loop {
            match self.stage {
                Stage::Connect => {
                    if remote.is_connected() {
                        self.stage = Stage::Upload;
                        continue;
                    }
                    if self.spawned_connect {
                        return Err(Error::Transport(transport::Error::NotConnected));
                    }
                    self.spawned_connect = true;
                    return Ok(Advance::Spawn(remote.prepare_connect(Direction::Push)?));
                }
                Stage::Upload => {
                    if self.updates.is_empty() {
                        remote.snapshot_refs()?;
                        remote.rebuild_refspecs_for_push();
                        self.updates = updates(remote, cx)?;
                        log::debug!(
                            target: "push",
                            "Pushing {} reference updates",
                            self.updates.len()
                        );
                    }
                    let transport = remote
                        .transport
                        .as_mut()
                        .ok_or(transport::Error::NotConnected)?;
                    match transport.push(&self.updates, events, remote.callbacks.as_mut())? {
                        Poll::Pending(readiness) => return Ok(Advance::Pending(readiness)),
                        Poll::Ready(statuses) => {
                            let callbacks = remote.callbacks.as_mut();
                            for status in &statuses {
                                callbacks
                                    .push_update_reference(&status.reference, status.message.as_deref());
                            }
                            self.statuses = statuses;
                            if self.transfer_only {
                                return Ok(Advance::Over);
                            }
                            events = Events::empty();
                            self.stage = Stage::Disconnect;
                        }
                    }
                }
                Stage::Disconnect => {
                    if let Some(transport) = remote.transport.as_mut() {
                        match transport.close(events)? {
                            Poll::Pending(readiness) => return Ok(Advance::Pending(readiness)),
                            Poll::Ready(()) => {
                                remote.transport = None;
                            }
                        }
                    }
                    events = Events::empty();
                    self.stage = Stage::Update;
                }
                Stage::Update => {
                    let _ = events;
                    remote.apply_push_tracking(cx, &self.updates, &self.statuses)?;
                    remote.release_scratch();
                    return Ok(Advance::Over);
                }
            }
        }
    }
}

/// Turn the active push refspecs into reference commands, resolving the
/// local side of each mapping.
fn updates<C: Context>(remote: &Remote, cx: &C) -> Result<Vec<PushUpdate>, Error> {
    if remote.active_refspecs.is_empty() {
        return Err(Error::Invalid(
            "no refspecs configured or given to push".to_owned(),
        ));
    }
    let mut out = Vec::new();
    for spec in &remote.active_refspecs {
        let Some(dst) = spec.dst() else {
            continue;
        };
        match spec.src() {
            None => out.push(PushUpdate {
                src: String::new(),
                dst: dst.as_str().to_owned(),
                oid: zero_oid(),
            }),
            Some(src) => {
                let name = RefStr::try_from_str(src.as_str()).map_err(|_| {
                    Error::Invalid(format!("source {:?} is not a valid reference", src.as_str()))
                })?;
                let oid = cx
                    .refname_to_id(name)
                    .map_err(Error::refdb)?
                    .ok_or_else(|| {
                        Error::Invalid(format!(
                            "source reference {:?} does not exist",
                            src.as_str()
                        ))
                    })?;
                out.push(PushUpdate {
                    src: src.as_str().to_owned(),
                    dst: dst.as_str().to_owned(),
                    oid,
                });
            }
        }
    }
    Ok(out)
}

impl Remote {
    /// Update the remote-tracking branches that mirror successfully
    /// pushed references, mapping each pushed destination through the
    /// configured fetch refspecs. `FETCH_HEAD` is not touched.
    pub(crate) fn apply_push_tracking<C: Context>(
        &mut self,
        cx: &mut C,
        updates: &[PushUpdate],
        statuses: &[PushStatus],
    ) -> Result<(), Error> {
        let fetch_specs: Vec<_> = self
            .refspecs
            .iter()
            .filter(|spec| spec.direction() == Direction::Fetch)
            .cloned()
            .collect();
        tips::push_tracking(
            cx,
            self.callbacks.as_mut(),
            &fetch_specs,
            updates,
            statuses,
            "update by push",
        )
    }
}
