//! The fetch pipeline.
//!
//! A fetch advances through fixed stages, in order:
//!
//!   1. connect (as a child frame, see [`crate::engine`]);
//!   2. snapshot the peer advertisement and rebuild the active
//!      refspecs;
//!   3. negotiate the pack contents;
//!   4. download the pack;
//!   5. disconnect;
//!   6. reconcile local references, and prune if enabled.
//!
//! Every network stage may suspend; the containing [`FetchOp`] frame
//! records where it stopped and is re-entered with the observed
//! readiness events.

use std::collections::BTreeSet;

use either::Either;
use git_ref_format::refspec::pattern;

use crate::callbacks::{Callbacks, Discard};
use crate::engine::{Advance, Events, Poll};
use crate::odb::Odb;
use crate::refdb::Refdb;
use crate::remote::Remote;
use crate::transport::{self, Proxy};
use crate::{Context, Direction, Error, Oid};

/// Pruning behavior of a single fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Prune {
    /// Follow the remote's configured `prune` setting.
    #[default]
    Unspecified,
    On,
    Off,
}

/// What to do with peer-advertised tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TagPolicy {
    /// Follow the remote's configured `tagopt` setting.
    #[default]
    Unspecified,
    /// Follow tags whose target object is present locally after the
    /// fetch. Never overwrites an existing local tag.
    Auto,
    /// Ignore tags entirely.
    None,
    /// Fetch all advertised tags.
    All,
}

/// Cumulative indexer progress of a pack transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub total_objects: u64,
    pub indexed_objects: u64,
    pub received_objects: u64,
    pub local_objects: u64,
    pub total_deltas: u64,
    pub indexed_deltas: u64,
    pub received_bytes: u64,
}

/// Options of a single fetch.
pub struct FetchOptions {
    pub callbacks: Box<dyn Callbacks>,
    pub prune: Prune,
    /// Whether to write `FETCH_HEAD` once the fetch completes.
    pub update_fetchhead: bool,
    pub download_tags: TagPolicy,
    pub proxy: Proxy,
    pub custom_headers: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            callbacks: Box::new(Discard),
            prune: Prune::default(),
            update_fetchhead: true,
            download_tags: TagPolicy::default(),
            proxy: Proxy::default(),
            custom_headers: Vec::new(),
        }
    }
}

/// What we tell the peer during pack negotiation: the tips we want, and
/// the objects we already have.
#[derive(Clone, Debug, Default)]
pub struct Negotiation {
    pub wants: Vec<Oid>,
    pub haves: Vec<Oid>,
}

/// Per-call fetch parameters, resolved against the remote's
/// configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Plan {
    pub prune: Prune,
    pub update_fetchhead: bool,
    pub tags: TagPolicy,
    /// Stop after the pack transfer; used by the standalone `download`
    /// operation, which leaves reconciliation to the caller.
    pub transfer_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Connect,
    Refs,
    Negotiate,
    Download,
    Disconnect,
    Update,
}

/// The resumable fetch operation.
pub(crate) struct FetchOp {
    stage: Stage,
    plan: Plan,
    negotiation: Option<Negotiation>,
    spawned_connect: bool,
}

impl FetchOp {
    pub(crate) fn new(plan: Plan) -> Self {
        Self {
            stage: Stage::Connect,
            plan,
            negotiation: None,
            spawned_connect: false,
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
                        self.stage = Stage::Refs;
                        continue;
                    }
                    if self.spawned_connect {
                        return Err(Error::Transport(transport::Error::NotConnected));
                    }
                    self.spawned_connect = true;
                    return Ok(Advance::Spawn(remote.prepare_connect(Direction::Fetch)?));
                }
                Stage::Refs => {
                    remote.snapshot_refs()?;
                    remote.rebuild_refspecs();
                    log::debug!(
                        target: "fetch",
                        "Peer advertised {} refs, {} active refspecs",
                        remote.refs.len(),
                        remote.active_refspecs.len()
                    );
                    self.stage = Stage::Negotiate;
                }
                Stage::Negotiate => {
                    let negotiation = match self.negotiation.take() {
                        Some(negotiation) => negotiation,
                        None => {
                            let negotiation = negotiate(remote, &*cx, self.plan.tags)?;
                            log::debug!(
                                target: "fetch",
                                "Negotiating: {} wants, {} haves",
                                negotiation.wants.len(),
                                negotiation.haves.len()
                            );
                            negotiation
                        }
                    };
                    let transport = remote
                        .transport
                        .as_mut()
                        .ok_or(transport::Error::NotConnected)?;
                    match transport.negotiate(&negotiation, events, remote.callbacks.as_mut())? {
                        Poll::Pending(readiness) => {
                            self.negotiation = Some(negotiation);
                            return Ok(Advance::Pending(readiness));
                        }
                        Poll::Ready(()) => {
                            events = Events::empty();
                            self.stage = Stage::Download;
                        }
                    }
                }
                Stage::Download => {
                    let transport = remote
                        .transport
                        .as_mut()
                        .ok_or(transport::Error::NotConnected)?;
                    match transport.download(
                        events,
                        &mut remote.stats,
                        remote.callbacks.as_mut(),
                    )? {
                        Poll::Pending(readiness) => return Ok(Advance::Pending(readiness)),
                        Poll::Ready(()) => {
                            if self.plan.transfer_only {
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
                    remote.apply_update_tips(cx, self.plan.tags, self.plan.update_fetchhead)?;
                    let prune = match self.plan.prune {
                        Prune::On => true,
                        Prune::Off => false,
                        Prune::Unspecified => remote.prune_refs,
                    };
                    if prune {
                        remote.apply_prune(cx)?;
                    }
                    remote.release_scratch();
                    return Ok(Advance::Over);
                }
            }
        }
    }
}

/// Assemble wants and haves from the advertisement, the active refspecs
/// and the local object database.
fn negotiate<C: Context>(remote: &Remote, cx: &C, tags: TagPolicy) -> Result<Negotiation, Error> {
    let mut wants = BTreeSet::new();
    for head in &remote.refs {
        if head.name == "HEAD" {
            continue;
        }
        let wanted = if head.name.starts_with("refs/tags/") {
            matches!(tags, TagPolicy::All)
                || remote
                    .active_refspecs
                    .iter()
                    .any(|spec| spec.src_matches(&head.name))
        } else {
            remote
                .active_refspecs
                .iter()
                .any(|spec| spec.src_matches(&head.name))
        };
        if !wanted || cx.contains(head.oid).map_err(Error::odb)? {
            continue;
        }
        wants.insert(head.oid);
    }

    let mut haves = BTreeSet::new();
    for (_, target) in cx
        .references_glob(&pattern!("refs/*"))
        .map_err(Error::refdb)?
    {
        if let Either::Left(oid) = target {
            haves.insert(oid);
        }
    }

    Ok(Negotiation {
        wants: wants.into_iter().collect(),
        haves: haves.into_iter().collect(),
    })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::remote::Remote;
    use crate::test::arbitrary::oid;
    use crate::test::mem::MemRepo;
    use crate::test::stub::StubTransport;
    use crate::test::{OpCallbacks, ReadinessRecorder, Recorder};
    use crate::transport::RemoteHead;
    use crate::{Events, Poll};

    fn repo_with_origin() -> MemRepo {
        let mut repo = MemRepo::default();
        repo.config
            .push("remote.origin.url", "https://example.org/r.git");
        repo.config
            .push("remote.origin.fetch", "+refs/heads/*:refs/remotes/origin/*");
        repo
    }

    fn options(callbacks: OpCallbacks) -> FetchOptions {
        FetchOptions {
            callbacks: callbacks.boxed(),
            ..FetchOptions::default()
        }
    }

    #[test]
    fn fetch_updates_tracking_refs_and_fetchhead() {
        let mut repo = repo_with_origin();
        repo.refdb.insert_symbolic("HEAD", "refs/heads/main");
        repo.config.push("branch.main.remote", "origin");
        repo.config.push("branch.main.merge", "refs/heads/main");

        let stub = StubTransport::new(vec![
            StubTransport::head("refs/heads/main", oid(1)),
            StubTransport::head("refs/heads/topic", oid(2)),
        ]);
        let state = stub.state();
        let recorder = Recorder::default();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();

        let poll = remote
            .fetch(
                &mut repo,
                &[],
                options(OpCallbacks::with_transport(stub).recorded(&recorder)),
                None,
            )
            .unwrap();
        assert!(matches!(poll, Poll::Ready(())));

        assert_eq!(repo.refdb.oid("refs/remotes/origin/main"), Some(oid(1)));
        assert_eq!(repo.refdb.oid("refs/remotes/origin/topic"), Some(oid(2)));
        assert_eq!(recorder.tips().len(), 2);

        // After completion the remote is idle and disconnected.
        assert!(remote.stack.is_empty());
        assert!(!remote.is_connected());
        let state = state.borrow();
        assert_eq!((state.connects, state.closes), (1, 1));

        // HEAD's upstream is the merge candidate and sorts first.
        let fetch_head = repo.fetch_head.clone().unwrap();
        assert_eq!(fetch_head.len(), 2);
        assert_eq!(fetch_head[0].name, "refs/heads/main");
        assert!(fetch_head[0].is_merge);
        assert!(!fetch_head[1].is_merge);
    }

    #[test]
    fn fetch_without_peer_changes_is_a_no_op() {
        let mut repo = repo_with_origin();
        let heads = vec![
            StubTransport::head("refs/heads/main", oid(1)),
            StubTransport::head("refs/heads/topic", oid(2)),
        ];
        let mut remote = Remote::lookup(&repo, "origin").unwrap();

        let first = Recorder::default();
        remote
            .fetch(
                &mut repo,
                &[],
                options(OpCallbacks::with_transport(StubTransport::new(heads.clone())).recorded(&first)),
                None,
            )
            .unwrap();
        assert_eq!(first.tips().len(), 2);

        let second = Recorder::default();
        remote
            .fetch(
                &mut repo,
                &[],
                options(OpCallbacks::with_transport(StubTransport::new(heads)).recorded(&second)),
                None,
            )
            .unwrap();
        assert_eq!(second.tips(), vec![]);
        let fetch_head = repo.fetch_head.clone().unwrap();
        assert_eq!(fetch_head.len(), 2);
    }

    #[test]
    fn fetch_with_prune_removes_gone_refs() {
        let mut repo = repo_with_origin();
        repo.refdb.insert("refs/remotes/origin/a", oid(10));
        repo.refdb.insert("refs/remotes/origin/b", oid(11));
        repo.refdb.insert("refs/remotes/origin/c", oid(12));

        let stub = StubTransport::new(vec![
            StubTransport::head("refs/heads/a", oid(10)),
            StubTransport::head("refs/heads/b", oid(11)),
        ]);
        let recorder = Recorder::default();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        let opts = FetchOptions {
            prune: Prune::On,
            callbacks: OpCallbacks::with_transport(stub).recorded(&recorder).boxed(),
            ..FetchOptions::default()
        };
        remote.fetch(&mut repo, &[], opts, None).unwrap();

        assert_eq!(repo.refdb.oid("refs/remotes/origin/a"), Some(oid(10)));
        assert_eq!(repo.refdb.oid("refs/remotes/origin/b"), Some(oid(11)));
        assert_eq!(repo.refdb.oid("refs/remotes/origin/c"), None);

        let tips = recorder.tips();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].0, "refs/remotes/origin/c");
        assert_eq!(tips[0].1, oid(12));
        assert!(tips[0].2.is_null());
    }

    #[test]
    fn explicit_refspec_still_updates_other_tracking_refs() {
        let mut repo = repo_with_origin();
        let stub = StubTransport::new(vec![
            StubTransport::head("refs/heads/topic", oid(2)),
            StubTransport::head("refs/heads/main", oid(3)),
        ]);
        let recorder = Recorder::default();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();

        remote
            .fetch(
                &mut repo,
                &["refs/heads/topic"],
                options(OpCallbacks::with_transport(stub).recorded(&recorder)),
                None,
            )
            .unwrap();

        // The requested ref lands in FETCH_HEAD, marked for merge.
        let fetch_head = repo.fetch_head.clone().unwrap();
        assert_eq!(fetch_head.len(), 1);
        assert_eq!(fetch_head[0].name, "refs/heads/topic");
        assert!(fetch_head[0].is_merge);

        // Both tracking refs were brought along opportunistically.
        assert_eq!(repo.refdb.oid("refs/remotes/origin/topic"), Some(oid(2)));
        assert_eq!(repo.refdb.oid("refs/remotes/origin/main"), Some(oid(3)));
        assert_eq!(recorder.tips().len(), 2);
    }

    #[test]
    fn configured_fetch_fires_each_update_once() {
        let mut repo = repo_with_origin();
        let stub = StubTransport::new(vec![
            StubTransport::head("refs/heads/main", oid(1)),
            StubTransport::head("refs/heads/topic", oid(2)),
        ]);
        let recorder = Recorder::default();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();

        remote
            .fetch(
                &mut repo,
                &[],
                options(OpCallbacks::with_transport(stub).recorded(&recorder)),
                None,
            )
            .unwrap();

        // No caller-supplied refspecs: the passive pass stays off, so
        // every ref is updated exactly once.
        assert_eq!(recorder.tips().len(), 2);
    }

    #[test]
    fn auto_followed_tag_without_object_stays_out_of_the_refdb() {
        let mut repo = repo_with_origin();
        let stub = StubTransport::new(vec![
            StubTransport::head("refs/heads/main", oid(1)),
            StubTransport::head("refs/tags/v1.0", oid(9)),
        ]);
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        remote
            .fetch(&mut repo, &[], options(OpCallbacks::with_transport(stub)), None)
            .unwrap();

        assert_eq!(repo.refdb.oid("refs/tags/v1.0"), None);
        let fetch_head = repo.fetch_head.clone().unwrap();
        assert!(fetch_head.iter().any(|e| e.name == "refs/tags/v1.0"));
    }

    #[test]
    fn auto_followed_tag_with_object_is_created() {
        let mut repo = repo_with_origin();
        repo.odb.insert(oid(9));
        let stub = StubTransport::new(vec![
            StubTransport::head("refs/heads/main", oid(1)),
            StubTransport::head("refs/tags/v1.0", oid(9)),
        ]);
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        remote
            .fetch(&mut repo, &[], options(OpCallbacks::with_transport(stub)), None)
            .unwrap();

        assert_eq!(repo.refdb.oid("refs/tags/v1.0"), Some(oid(9)));
    }

    #[test]
    fn negotiation_requests_missing_matched_objects() {
        let mut repo = repo_with_origin();
        repo.odb.insert(oid(1));
        repo.refdb.insert("refs/heads/local", oid(7));

        let stub = StubTransport::new(vec![
            StubTransport::head("refs/heads/present", oid(1)),
            StubTransport::head("refs/heads/missing", oid(2)),
            StubTransport::head("refs/tags/v1.0", oid(3)),
            StubTransport::head("refs/pull/1", oid(4)),
        ]);
        let state = stub.state();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        remote
            .fetch(&mut repo, &[], options(OpCallbacks::with_transport(stub)), None)
            .unwrap();

        let state = state.borrow();
        let negotiation = state.negotiation.as_ref().unwrap();
        // Wanted: the missing matched head. Present objects, unmatched
        // refs and auto-policy tags are not wanted.
        assert_eq!(negotiation.wants, vec![oid(2)]);
        assert_eq!(negotiation.haves, vec![oid(7)]);
    }

    #[test]
    fn cooperative_fetch_suspends_and_resumes() {
        let mut repo = repo_with_origin();
        let heads = vec![StubTransport::head("refs/heads/main", oid(1))];

        // Cooperative run: connect suspends once.
        let stub = StubTransport::new(heads.clone()).suspending_connect(1, 7);
        let sink = ReadinessRecorder::default();
        let recorder = Recorder::default();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        let poll = remote
            .fetch(
                &mut repo,
                &[],
                options(
                    OpCallbacks::with_transport(stub)
                        .recorded(&recorder)
                        .cooperative(&sink),
                ),
                None,
            )
            .unwrap();

        let Poll::Pending(readiness) = poll else {
            panic!("expected suspension");
        };
        assert_eq!(readiness.fd, 7);
        let (fd, interest, timeout) = sink.take().unwrap();
        assert_eq!(fd, 7);
        assert_eq!(interest, Events::READ | Events::WRITE);
        assert!(timeout.is_some());

        // While the connect is suspended, the transport sits in the
        // dedicated slot and the remote is busy.
        assert!(remote.transport.is_none());
        assert!(remote.connect_transport.is_some());
        assert!(matches!(
            remote.fetch(&mut repo, &[], FetchOptions::default(), None),
            Err(crate::Error::Busy)
        ));

        let poll = remote.perform(&mut repo, Events::READ).unwrap();
        assert!(matches!(poll, Poll::Ready(())));
        assert!(remote.stack.is_empty());
        assert_eq!(recorder.tips().len(), 1);

        // Synchronous run over the same input: identical side effects.
        let mut sync_repo = repo_with_origin();
        let mut sync_remote = Remote::lookup(&sync_repo, "origin").unwrap();
        sync_remote
            .fetch(
                &mut sync_repo,
                &[],
                options(OpCallbacks::with_transport(StubTransport::new(heads))),
                None,
            )
            .unwrap();
        assert_eq!(
            repo.refdb.oid("refs/remotes/origin/main"),
            sync_repo.refdb.oid("refs/remotes/origin/main")
        );
        assert_eq!(repo.fetch_head, sync_repo.fetch_head);
    }

    #[test]
    fn synchronous_driver_waits_on_the_descriptor() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) }, 1);

        let mut repo = repo_with_origin();
        let stub = StubTransport::new(vec![StubTransport::head("refs/heads/main", oid(1))])
            .suspending_connect(1, fds[0]);
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        let poll = remote
            .fetch(&mut repo, &[], options(OpCallbacks::with_transport(stub)), None)
            .unwrap();

        assert!(matches!(poll, Poll::Ready(())));
        assert_eq!(repo.refdb.oid("refs/remotes/origin/main"), Some(oid(1)));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn timeout_event_fails_the_operation_and_leaves_the_remote_idle() {
        let mut repo = repo_with_origin();
        let stub = StubTransport::new(vec![]).suspending_connect(1, 7);
        let sink = ReadinessRecorder::default();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        let poll = remote
            .fetch(
                &mut repo,
                &[],
                options(OpCallbacks::with_transport(stub).cooperative(&sink)),
                None,
            )
            .unwrap();
        assert!(poll.is_pending());

        let err = remote.perform(&mut repo, Events::TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Transport(crate::transport::Error::TimedOut)
        ));
        assert!(remote.stack.is_empty());
        assert!(remote.transport.is_none() && remote.connect_transport.is_none());
    }

    #[test]
    fn stop_cancels_the_next_transport_call() {
        let mut repo = repo_with_origin();
        let stub = StubTransport::new(vec![StubTransport::head("refs/heads/main", oid(1))]);
        let state = stub.state();
        let mut remote = Remote::lookup(&repo, "origin").unwrap();
        remote
            .connect(
                Direction::Fetch,
                crate::remote::ConnectOptions {
                    callbacks: OpCallbacks::with_transport(stub).boxed(),
                    ..crate::remote::ConnectOptions::default()
                },
            )
            .unwrap()
            .expect_ready("stub connect is synchronous");

        remote.stop();
        assert!(state.borrow().canceled);

        let err = remote
            .fetch(&mut repo, &[], FetchOptions::default(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Transport(crate::transport::Error::Canceled)
        ));
        assert!(remote.stack.is_empty());
    }

    #[test]
    fn download_leaves_reconciliation_to_the_caller() {
        let mut repo = repo_with_origin();
        let stub = StubTransport::new(vec![StubTransport::head("refs/heads/main", oid(1))]);
        let mut remote = Remote::lookup(&repo, "origin").unwrap();

        remote
            .download(&mut repo, &[], options(OpCallbacks::with_transport(stub)))
            .unwrap()
            .expect_ready("stub download is synchronous");

        // Nothing reconciled yet; the connection is still open.
        assert_eq!(repo.refdb.oid("refs/remotes/origin/main"), None);
        assert!(remote.is_connected());
        assert_eq!(remote.stats().received_objects, 1);

        remote
            .update_tips(&mut repo, None, true, TagPolicy::Unspecified, None)
            .unwrap();
        assert_eq!(repo.refdb.oid("refs/remotes/origin/main"), Some(oid(1)));

        remote.disconnect().unwrap();
        assert!(!remote.is_connected());
    }

    #[test]
    fn anonymous_fetch_lists_head_in_fetchhead() {
        let mut repo = MemRepo::default();
        let stub = StubTransport::new(vec![RemoteHead {
            name: "HEAD".to_owned(),
            oid: oid(1),
            symref_target: Some("refs/heads/main".to_owned()),
        }]);
        let mut remote =
            Remote::create_anonymous(&repo, "https://example.org/r.git").unwrap();
        remote
            .fetch(&mut repo, &[], options(OpCallbacks::with_transport(stub)), None)
            .unwrap();

        let fetch_head = repo.fetch_head.clone().unwrap();
        assert_eq!(fetch_head.len(), 1);
        assert_eq!(fetch_head[0].name, "HEAD");
        assert!(fetch_head[0].is_merge);
        assert_eq!(remote.default_branch().unwrap().as_str(), "refs/heads/main");
    }
}
