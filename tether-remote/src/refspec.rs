//! Refspec parsing, matching and transformation.
//!
//! A [`Refspec`] maps reference names advertised by a peer onto local
//! reference names (or the reverse, for pushes). Both sides of the
//! mapping are refspec patterns as defined by `git-check-ref-format`,
//! with at most one `*`, and a side is a *wildcard* iff its pattern ends
//! in `*`. [`expand`] performs the "do what I mean" step: wildcard specs
//! are enumerated against a concrete peer advertisement, non-wildcard
//! specs are carried through unchanged.

use std::fmt;

use git_ref_format::refspec::{PatternStr, PatternString};
use git_ref_format::RefString;
use thiserror::Error;

use crate::transport::RemoteHead;
use crate::Direction;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty refspec")]
    Empty,
    #[error("invalid refspec {spec:?}: {err}")]
    Format {
        spec: String,
        #[source]
        err: git_ref_format::Error,
    },
    #[error("invalid refspec {0:?}: a wildcard must terminate the pattern")]
    WildcardPosition(String),
    #[error("invalid refspec {0:?}: both sides must use a wildcard, or neither")]
    WildcardMismatch(String),
}

/// A single reference mapping.
#[derive(Clone, Debug)]
pub struct Refspec {
    src: Option<PatternString>,
    dst: Option<PatternString>,
    direction: Direction,
    force: bool,
    raw: String,
}

impl PartialEq for Refspec {
    fn eq(&self, other: &Self) -> bool {
        self.src == other.src
            && self.dst == other.dst
            && self.direction == other.direction
            && self.force == other.force
    }
}

impl Eq for Refspec {}

impl Refspec {
    /// Parse a refspec from its literal representation.
    ///
    /// For push refspecs, a missing destination means "same as source",
    /// per the `git push <src>` convention.
    pub fn parse(spec: &str, direction: Direction) -> Result<Self, ParseError> {
        let raw = spec.to_owned();
        let (force, rest) = match spec.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }
        let (src, dst) = match rest.split_once(':') {
            Some((src, dst)) => (side(src, &raw)?, side(dst, &raw)?),
            None => {
                let src = side(rest, &raw)?;
                let dst = match direction {
                    Direction::Fetch => None,
                    Direction::Push => src.clone(),
                };
                (src, dst)
            }
        };
        match (&src, &dst) {
            (Some(s), Some(d)) if is_glob(s) != is_glob(d) => {
                return Err(ParseError::WildcardMismatch(raw));
            }
            _ => {}
        }

        Ok(Self {
            src,
            dst,
            direction,
            force,
            raw,
        })
    }

    /// The default fetch refspec installed for a named remote:
    /// `+refs/heads/*:refs/remotes/<name>/*`.
    pub fn default_fetch(name: &str) -> Result<Self, ParseError> {
        Self::parse(
            &format!("+refs/heads/*:refs/remotes/{name}/*"),
            Direction::Fetch,
        )
    }

    pub fn src(&self) -> Option<&PatternStr> {
        self.src.as_deref()
    }

    pub fn dst(&self) -> Option<&PatternStr> {
        self.dst.as_deref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_force(&self) -> bool {
        self.force
    }

    /// A refspec is a wildcard iff its source pattern ends in `*`.
    pub fn is_wildcard(&self) -> bool {
        match (&self.src, &self.dst) {
            (Some(src), _) => is_glob(src),
            (None, Some(dst)) => is_glob(dst),
            (None, None) => false,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn src_matches(&self, name: &str) -> bool {
        self.src.as_deref().map_or(false, |p| matches(p, name))
    }

    pub fn dst_matches(&self, name: &str) -> bool {
        self.dst.as_deref().map_or(false, |p| matches(p, name))
    }

    /// Map a peer reference name through this spec, yielding the local
    /// name. `None` if the name does not match the source pattern, or the
    /// spec has no destination.
    pub fn transform(&self, name: &str) -> Option<RefString> {
        let src = self.src.as_deref()?;
        let dst = self.dst.as_deref()?;
        rewrite(src, dst, name)
    }

    /// The inverse of [`Refspec::transform`]: map a local reference name
    /// back to the peer name it came from.
    pub fn rtransform(&self, name: &str) -> Option<RefString> {
        let src = self.src.as_deref()?;
        let dst = self.dst.as_deref()?;
        rewrite(dst, src, name)
    }
}

impl fmt::Display for Refspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Expand a refspec list against a peer advertisement.
///
/// Wildcard specs yield one concrete spec per matching advertised ref;
/// advertised names that do not satisfy the reference grammar are
/// skipped. Non-wildcard specs are carried through unchanged.
pub fn expand(specs: &[Refspec], heads: &[RemoteHead]) -> Vec<Refspec> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        if !spec.is_wildcard() {
            out.push(spec.clone());
            continue;
        }
        for head in heads {
            if RefString::try_from(head.name.clone()).is_err() {
                continue;
            }
            if !spec.src_matches(&head.name) {
                continue;
            }
            let src = match PatternString::try_from(head.name.clone()) {
                Ok(src) => src,
                Err(_) => continue,
            };
            let dst = spec
                .transform(&head.name)
                .map(PatternString::from);
            let raw = match &dst {
                Some(dst) => format!(
                    "{}{}:{}",
                    if spec.force { "+" } else { "" },
                    src,
                    dst
                ),
                None => format!("{}{}", if spec.force { "+" } else { "" }, src),
            };
            out.push(Refspec {
                src: Some(src),
                dst,
                direction: spec.direction,
                force: spec.force,
                raw,
            });
        }
    }
    out
}

fn side(s: &str, raw: &str) -> Result<Option<PatternString>, ParseError> {
    if s.is_empty() {
        return Ok(None);
    }
    let pattern = PatternString::try_from(s.to_owned()).map_err(|err| ParseError::Format {
        spec: raw.to_owned(),
        err,
    })?;
    if pattern.as_str().contains('*') && !is_glob(&pattern) {
        return Err(ParseError::WildcardPosition(raw.to_owned()));
    }
    Ok(Some(pattern))
}

fn is_glob(p: &PatternStr) -> bool {
    p.as_str().ends_with('*')
}

fn matches(pattern: &PatternStr, name: &str) -> bool {
    match pattern.as_str().strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern.as_str() == name,
    }
}

fn rewrite(from: &PatternStr, to: &PatternStr, name: &str) -> Option<RefString> {
    match from.as_str().strip_suffix('*') {
        Some(prefix) => {
            let suffix = name.strip_prefix(prefix)?;
            let stem = to.as_str().strip_suffix('*')?;
            RefString::try_from(format!("{stem}{suffix}")).ok()
        }
        None => {
            if from.as_str() != name {
                return None;
            }
            RefString::try_from(to.as_str().to_owned()).ok()
        }
    }
}

#[cfg(test)]
mod test {
    use qcheck_macros::quickcheck;

    use super::*;
    use crate::test::arbitrary::RefSuffix;
    use crate::Oid;

    fn head(name: &str) -> RemoteHead {
        RemoteHead {
            name: name.to_owned(),
            oid: Oid::null(gix_hash::Kind::Sha1),
            symref_target: None,
        }
    }

    #[test]
    fn parse_fetch_spec() {
        let spec = Refspec::parse("+refs/heads/*:refs/remotes/origin/*", Direction::Fetch).unwrap();
        assert!(spec.is_force());
        assert!(spec.is_wildcard());
        assert_eq!(spec.src().unwrap().as_str(), "refs/heads/*");
        assert_eq!(spec.dst().unwrap().as_str(), "refs/remotes/origin/*");
        assert_eq!(spec.to_string(), "+refs/heads/*:refs/remotes/origin/*");
    }

    #[test]
    fn parse_source_only_fetch_spec() {
        let spec = Refspec::parse("refs/heads/topic", Direction::Fetch).unwrap();
        assert!(!spec.is_force());
        assert!(spec.dst().is_none());
        assert!(spec.src_matches("refs/heads/topic"));
        assert!(!spec.src_matches("refs/heads/topic2"));
    }

    #[test]
    fn parse_push_spec_defaults_destination() {
        let spec = Refspec::parse("refs/heads/main", Direction::Push).unwrap();
        assert_eq!(spec.dst().unwrap().as_str(), "refs/heads/main");
    }

    #[test]
    fn parse_push_delete_spec() {
        let spec = Refspec::parse(":refs/heads/gone", Direction::Push).unwrap();
        assert!(spec.src().is_none());
        assert_eq!(spec.dst().unwrap().as_str(), "refs/heads/gone");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            Refspec::parse("", Direction::Fetch),
            Err(ParseError::Empty)
        ));
        assert!(matches!(
            Refspec::parse("+", Direction::Fetch),
            Err(ParseError::Empty)
        ));
        assert!(matches!(
            Refspec::parse("refs/heads/*:refs/remotes/origin/x", Direction::Fetch),
            Err(ParseError::WildcardMismatch(_))
        ));
        assert!(matches!(
            Refspec::parse("refs/he..ads/x", Direction::Fetch),
            Err(ParseError::Format { .. })
        ));
        assert!(matches!(
            Refspec::parse("refs/*/heads:refs/*/remotes", Direction::Fetch),
            Err(ParseError::WildcardPosition(_))
        ));
    }

    #[test]
    fn default_fetch_shape() {
        let spec = Refspec::default_fetch("origin").unwrap();
        assert_eq!(spec.raw(), "+refs/heads/*:refs/remotes/origin/*");
        assert!(Refspec::default_fetch("bad..name").is_err());
    }

    #[test]
    fn transform_and_back() {
        let spec = Refspec::default_fetch("origin").unwrap();
        let local = spec.transform("refs/heads/main").unwrap();
        assert_eq!(local.as_str(), "refs/remotes/origin/main");
        let peer = spec.rtransform(local.as_str()).unwrap();
        assert_eq!(peer.as_str(), "refs/heads/main");
        assert_eq!(spec.transform("refs/tags/v1.0"), None);
    }

    #[test]
    fn transform_without_wildcard() {
        let spec = Refspec::parse(
            "refs/heads/main:refs/remotes/origin/main",
            Direction::Fetch,
        )
        .unwrap();
        assert_eq!(
            spec.transform("refs/heads/main").unwrap().as_str(),
            "refs/remotes/origin/main"
        );
        assert_eq!(spec.transform("refs/heads/other"), None);
    }

    #[test]
    fn expand_enumerates_wildcards() {
        let specs = [Refspec::default_fetch("origin").unwrap()];
        let heads = [
            head("refs/heads/main"),
            head("refs/heads/topic"),
            head("refs/tags/v1.0"),
            head("refs/invalid..name"),
        ];
        let active = expand(&specs, &heads);
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].src().unwrap().as_str(), "refs/heads/main");
        assert_eq!(
            active[0].dst().unwrap().as_str(),
            "refs/remotes/origin/main"
        );
        assert!(!active[0].is_wildcard());
        assert_eq!(active[1].src().unwrap().as_str(), "refs/heads/topic");
    }

    #[test]
    fn expand_passes_concrete_specs_through() {
        let specs = [Refspec::parse("refs/heads/topic", Direction::Fetch).unwrap()];
        let active = expand(&specs, &[head("refs/heads/main")]);
        assert_eq!(active, specs);
    }

    #[quickcheck]
    fn prop_default_fetchspec_roundtrip(suffix: RefSuffix) {
        let spec = Refspec::default_fetch("origin").unwrap();
        let peer = format!("refs/heads/{}", suffix.as_str());
        let local = spec.transform(&peer).unwrap();
        assert_eq!(local.as_str(), format!("refs/remotes/origin/{}", suffix.as_str()));
        assert_eq!(spec.rtransform(local.as_str()).unwrap().as_str(), peer);
    }
}
