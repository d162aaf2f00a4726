//! Reference reconciliation after a fetch or push.
//!
//! [`UpdateTips`] applies the refspecs that drove a fetch against the
//! peer advertisement: remote-tracking branches are created or moved,
//! tags are followed according to the tag policy, and `FETCH_HEAD`
//! entries are assembled. When the caller fetched a narrower set than
//! the configuration describes, the configured refspecs additionally
//! drive opportunistic tracking updates on the side. Peer-advertised
//! names that fail the reference grammar never reach local storage;
//! they are skipped here.

use std::collections::BTreeSet;

use either::Either;
use git_ref_format::{refname, RefStr, RefString};

use crate::callbacks::Callbacks;
use crate::config::ConfigRead;
use crate::fetch::TagPolicy;
use crate::fetchhead;
use crate::odb::Odb;
use crate::push::{PushStatus, PushUpdate};
use crate::refdb::Refdb;
use crate::refspec::Refspec;
use crate::transport::RemoteHead;
use crate::{zero_oid, Context, Direction, Error, Oid};

/// One reconciliation pass over the peer advertisement.
pub(crate) struct UpdateTips<'a> {
    pub refs: &'a [RemoteHead],
    /// The refspecs that drove the fetch: the caller-supplied set, or
    /// the configured fetch refspecs.
    pub specs: &'a [Refspec],
    /// The configured fetch refspecs, expanded; drives opportunistic
    /// updates.
    pub passive: &'a [Refspec],
    /// Whether the caller supplied explicit refspecs for this fetch.
    pub passed: bool,
    pub url: Option<&'a str>,
    pub name: Option<&'a str>,
    pub tags: TagPolicy,
    pub update_fetchhead: bool,
    pub message: &'a str,
}

impl UpdateTips<'_> {
    pub fn run<C: Context>(&self, cx: &mut C, callbacks: &mut dyn Callbacks) -> Result<(), Error> {
        let upstream = self.upstream_merge(cx)?;
        let mut entries: Vec<fetchhead::Entry> = Vec::new();
        let mut listed = BTreeSet::new();
        let specs: Vec<&Refspec> = self
            .specs
            .iter()
            .filter(|spec| spec.direction() == Direction::Fetch)
            .collect();

        for head in self.refs {
            let Ok(name) = RefStr::try_from_str(&head.name) else {
                continue;
            };

            if head.name.starts_with("refs/tags/") {
                match self.tags {
                    TagPolicy::None => continue,
                    TagPolicy::All => {
                        update(cx, callbacks, name, head.oid, false, self.message)?;
                        self.list(&mut entries, &mut listed, head, false);
                    }
                    TagPolicy::Auto | TagPolicy::Unspecified => {
                        if cx.contains(head.oid).map_err(Error::odb)? {
                            update(cx, callbacks, name, head.oid, true, self.message)?;
                        }
                        // The candidate is recorded even when the object
                        // is absent and no local ref is created.
                        self.list(&mut entries, &mut listed, head, false);
                    }
                }
                continue;
            }

            let mut matched = false;
            for spec in &specs {
                if !spec.src_matches(&head.name) {
                    continue;
                }
                let is_merge = match spec.is_wildcard() {
                    true => upstream.as_deref() == Some(head.name.as_str()),
                    false => true,
                };
                if !matched {
                    self.list(&mut entries, &mut listed, head, is_merge);
                    matched = true;
                }
                if let Some(local) = spec.transform(&head.name) {
                    update(cx, callbacks, &local, head.oid, false, self.message)?;
                }
            }
            if specs.is_empty() && head.name == "HEAD" {
                self.list(&mut entries, &mut listed, head, true);
            }
        }

        if self.passed {
            opportunistic(cx, callbacks, self.refs, self.passive, self.message)?;
        }

        if self.update_fetchhead && self.url.is_some() {
            // Merge candidates come first; advertisement order is kept
            // within each group.
            entries.sort_by_key(|entry| !entry.is_merge);
            cx.write_fetch_head(&entries).map_err(Error::fetchhead)?;
        }
        Ok(())
    }

    fn list(
        &self,
        entries: &mut Vec<fetchhead::Entry>,
        listed: &mut BTreeSet<String>,
        head: &RemoteHead,
        is_merge: bool,
    ) {
        let Some(url) = self.url else {
            return;
        };
        if listed.insert(head.name.clone()) {
            entries.push(fetchhead::Entry {
                oid: head.oid,
                is_merge,
                name: head.name.clone(),
                url: url.to_owned(),
            });
        }
    }

    /// The peer ref that local `HEAD`'s upstream tracks on this remote,
    /// if any. Determines the merge candidate of wildcard fetches.
    fn upstream_merge<C: Context>(&self, cx: &C) -> Result<Option<String>, Error> {
        let Some(name) = self.name else {
            return Ok(None);
        };
        let head = cx.find(&refname!("HEAD")).map_err(Error::refdb)?;
        let Some(Either::Right(target)) = head else {
            return Ok(None);
        };
        let Some(branch) = target.as_str().strip_prefix("refs/heads/") else {
            return Ok(None);
        };
        let remote = cx
            .string(&format!("branch.{branch}.remote"))
            .map_err(Error::config)?;
        if remote.as_deref() != Some(name) {
            return Ok(None);
        }
        cx.string(&format!("branch.{branch}.merge"))
            .map_err(Error::config)
    }
}

/// Create or move a single local reference, firing the `update_tips`
/// callback on change. Auto-followed tags never displace an existing
/// local tag.
fn update<C: Context>(
    cx: &mut C,
    callbacks: &mut dyn Callbacks,
    name: &RefStr,
    new: Oid,
    auto_tag: bool,
    message: &str,
) -> Result<(), Error> {
    let old = cx.refname_to_id(name).map_err(Error::refdb)?;
    if old == Some(new) {
        return Ok(());
    }
    if auto_tag && old.is_some() {
        return Ok(());
    }
    cx.set(name, new, message).map_err(Error::refdb)?;
    log::trace!(target: "fetch", "Updated {} -> {}", name, new);
    callbacks.update_tips(name, old.unwrap_or_else(zero_oid), new);
    Ok(())
}

/// Remote-tracking updates for advertised refs the caller did not ask
/// for, driven by the configured (passive) refspecs. Updates race with
/// nothing: a lost compare-and-set or an already-current ref is skipped
/// silently. These refs never appear in `FETCH_HEAD`.
fn opportunistic<C: Context>(
    cx: &mut C,
    callbacks: &mut dyn Callbacks,
    refs: &[RemoteHead],
    passive: &[Refspec],
    message: &str,
) -> Result<(), Error> {
    for head in refs {
        if RefStr::try_from_str(&head.name).is_err() {
            continue;
        }
        for spec in passive {
            if !spec.src_matches(&head.name) {
                continue;
            }
            let Some(local) = spec.transform(&head.name) else {
                continue;
            };
            let old = cx.refname_to_id(&local).map_err(Error::refdb)?;
            if old == Some(head.oid) {
                continue;
            }
            if cx
                .compare_and_set(&local, old, head.oid, message)
                .map_err(Error::refdb)?
            {
                callbacks.update_tips(&local, old.unwrap_or_else(zero_oid), head.oid);
            }
        }
    }
    Ok(())
}

/// Delete local refs matching a configured destination whose peer-side
/// source is no longer advertised. Symbolic refs are never pruned.
pub(crate) fn prune<C: Context>(
    cx: &mut C,
    callbacks: &mut dyn Callbacks,
    refs: &[RemoteHead],
    specs: &[Refspec],
) -> Result<(), Error> {
    let advertised: BTreeSet<&str> = refs.iter().map(|head| head.name.as_str()).collect();
    let mut pruned = BTreeSet::new();

    for spec in specs {
        if spec.direction() != Direction::Fetch {
            continue;
        }
        let Some(dst) = spec.dst() else {
            continue;
        };
        for (name, target) in cx.references_glob(dst).map_err(Error::refdb)? {
            if pruned.contains(&name) {
                continue;
            }
            let Either::Left(old) = target else {
                continue;
            };
            let Some(peer) = spec.rtransform(name.as_str()) else {
                continue;
            };
            if advertised.contains(peer.as_str()) {
                continue;
            }
            cx.delete(&name).map_err(Error::refdb)?;
            log::debug!(target: "fetch", "Pruned {}", name);
            callbacks.update_tips(&name, old, zero_oid());
            pruned.insert(name);
        }
    }
    Ok(())
}

/// Mirror successfully pushed refs onto their remote-tracking branches,
/// mapping each pushed destination through the configured fetch
/// refspecs.
pub(crate) fn push_tracking<C: Context>(
    cx: &mut C,
    callbacks: &mut dyn Callbacks,
    fetch_specs: &[Refspec],
    updates: &[PushUpdate],
    statuses: &[PushStatus],
    message: &str,
) -> Result<(), Error> {
    for status in statuses {
        if status.message.is_some() {
            continue;
        }
        let Some(pushed) = updates.iter().find(|up| up.dst == status.reference) else {
            continue;
        };
        for spec in fetch_specs {
            if !spec.src_matches(&pushed.dst) {
                continue;
            }
            let Some(local) = spec.transform(&pushed.dst) else {
                continue;
            };
            let old = cx.refname_to_id(&local).map_err(Error::refdb)?;
            if pushed.oid.is_null() {
                if let Some(old) = old {
                    cx.delete(&local).map_err(Error::refdb)?;
                    callbacks.update_tips(&local, old, zero_oid());
                }
            } else {
                if old == Some(pushed.oid) {
                    continue;
                }
                cx.set(&local, pushed.oid, message).map_err(Error::refdb)?;
                callbacks.update_tips(&local, old.unwrap_or_else(zero_oid), pushed.oid);
            }
        }
    }
    Ok(())
}

/// The branch the peer considers current: the `HEAD` symref target if
/// advertised, otherwise a branch pointing at the same object as `HEAD`,
/// preferring `refs/heads/master`.
pub(crate) fn default_branch(refs: &[RemoteHead]) -> Result<RefString, Error> {
    let head = refs
        .iter()
        .find(|h| h.name == "HEAD")
        .ok_or(Error::NoDefaultBranch)?;
    if let Some(target) = &head.symref_target {
        return RefString::try_from(target.clone()).map_err(|_| Error::NoDefaultBranch);
    }
    let mut candidate: Option<&RemoteHead> = None;
    for h in refs {
        if !h.name.starts_with("refs/heads/") || h.oid != head.oid {
            continue;
        }
        if h.name == "refs/heads/master" {
            candidate = Some(h);
            break;
        }
        if candidate.is_none() {
            candidate = Some(h);
        }
    }
    candidate
        .and_then(|h| RefString::try_from(h.name.clone()).ok())
        .ok_or(Error::NoDefaultBranch)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::arbitrary::oid;
    use crate::test::mem::MemRepo;
    use crate::test::Recorder;

    fn head(name: &str, oid: Oid) -> RemoteHead {
        RemoteHead {
            name: name.to_owned(),
            oid,
            symref_target: None,
        }
    }

    #[test]
    fn update_skips_when_current() {
        let mut repo = MemRepo::default();
        let recorder = Recorder::default();
        let tip = oid(1);
        repo.refdb.insert("refs/remotes/origin/main", tip);

        update(
            &mut repo,
            &mut recorder.callbacks(),
            RefStr::try_from_str("refs/remotes/origin/main").unwrap(),
            tip,
            false,
            "fetch",
        )
        .unwrap();
        assert!(recorder.tips().is_empty());
    }

    #[test]
    fn auto_tag_never_overwrites() {
        let mut repo = MemRepo::default();
        let recorder = Recorder::default();
        let ours = oid(1);
        let theirs = oid(2);
        repo.refdb.insert("refs/tags/v1.0", ours);

        update(
            &mut repo,
            &mut recorder.callbacks(),
            RefStr::try_from_str("refs/tags/v1.0").unwrap(),
            theirs,
            true,
            "fetch",
        )
        .unwrap();
        assert_eq!(repo.refdb.oid("refs/tags/v1.0"), Some(ours));
        assert!(recorder.tips().is_empty());
    }

    #[test]
    fn prune_skips_symbolic_refs() {
        let mut repo = MemRepo::default();
        let recorder = Recorder::default();
        repo.refdb.insert("refs/remotes/origin/gone", oid(1));
        repo.refdb
            .insert_symbolic("refs/remotes/origin/HEAD", "refs/remotes/origin/gone");
        let specs = [Refspec::default_fetch("origin").unwrap()];

        prune(&mut repo, &mut recorder.callbacks(), &[], &specs).unwrap();

        assert_eq!(repo.refdb.oid("refs/remotes/origin/gone"), None);
        assert!(repo.refdb.find_symbolic("refs/remotes/origin/HEAD").is_some());
        let tips = recorder.tips();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].0, "refs/remotes/origin/gone");
        assert!(tips[0].2.is_null());
    }

    #[test]
    fn default_branch_prefers_symref_target() {
        let tip = oid(1);
        let refs = [
            RemoteHead {
                name: "HEAD".to_owned(),
                oid: tip,
                symref_target: Some("refs/heads/devel".to_owned()),
            },
            head("refs/heads/devel", tip),
            head("refs/heads/master", tip),
        ];
        assert_eq!(default_branch(&refs).unwrap().as_str(), "refs/heads/devel");
    }

    #[test]
    fn default_branch_guesses_by_object_id() {
        let tip = oid(1);
        let refs = [
            head("HEAD", tip),
            head("refs/heads/apple", tip),
            head("refs/heads/master", tip),
            head("refs/heads/other", oid(2)),
        ];
        assert_eq!(default_branch(&refs).unwrap().as_str(), "refs/heads/master");

        let refs = [
            head("HEAD", tip),
            head("refs/heads/apple", tip),
            head("refs/heads/banana", tip),
        ];
        assert_eq!(default_branch(&refs).unwrap().as_str(), "refs/heads/apple");
    }

    #[test]
    fn default_branch_not_found() {
        assert!(matches!(default_branch(&[]), Err(Error::NoDefaultBranch)));
        let refs = [head("HEAD", oid(1)), head("refs/heads/main", oid(2))];
        assert!(matches!(
            default_branch(&refs),
            Err(Error::NoDefaultBranch)
        ));
    }
}
