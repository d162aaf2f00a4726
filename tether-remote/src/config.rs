//! The configuration store, as consumed by remote operations.
//!
//! Remotes are persisted under `remote.<name>.*` keys, with URL rewrite
//! rules under `url.<prefix>.insteadof` / `url.<prefix>.pushinsteadof`.
//! The store itself lives elsewhere; this module defines the service
//! traits plus the read paths (remote layout, tag option, prune and proxy
//! fallback chains) and the URL pipeline (canonicalization and insteadof
//! application).
//!
//! Keys are canonical git configuration keys: section and variable names
//! lowercased, subsections verbatim.

use crate::fetch::TagPolicy;
use crate::refspec::Refspec;
use crate::{Direction, Error};

/// Read access to the configuration store.
///
/// Optional keys are `Ok(None)`; errors are reserved for store failures.
/// A `&impl ConfigRead` borrow spans a single remote operation and doubles
/// as the configuration snapshot for that operation.
pub trait ConfigRead {
    type Error: std::error::Error + Send + Sync + 'static;

    fn string(&self, key: &str) -> Result<Option<String>, Self::Error>;

    fn boolean(&self, key: &str) -> Result<Option<bool>, Self::Error>;

    /// All values of a multi-valued key, in configuration order.
    fn multivar(&self, key: &str) -> Result<Vec<String>, Self::Error>;

    /// All `(key, value)` entries whose key matches `glob` (`*` matches
    /// any run of characters), in configuration order.
    fn entries(&self, glob: &str) -> Result<Vec<(String, String)>, Self::Error>;
}

/// Write access to the configuration store.
pub trait ConfigWrite: ConfigRead {
    /// Set a single-valued key, replacing any existing value.
    fn set(&mut self, key: &str, value: &str) -> Result<(), Self::Error>;

    /// Append a new value to a multi-valued key, never displacing
    /// existing entries.
    fn add(&mut self, key: &str, value: &str) -> Result<(), Self::Error>;

    /// Remove a single-valued key. Removing an absent key is not an
    /// error.
    fn unset(&mut self, key: &str) -> Result<(), Self::Error>;

    /// Remove every value of a multi-valued key.
    fn unset_all(&mut self, key: &str) -> Result<(), Self::Error>;

    /// Rename a section, carrying all its entries over.
    fn rename_section(&mut self, old: &str, new: &str) -> Result<(), Self::Error>;

    /// Remove a section and all its entries.
    fn remove_section(&mut self, section: &str) -> Result<(), Self::Error>;
}

/// A `remote.<name>.*` configuration key.
pub(crate) fn key(name: &str, field: &str) -> String {
    format!("remote.{name}.{field}")
}

/// The configured state of a named remote.
pub(crate) struct RemoteConfig {
    pub url: Option<String>,
    pub push_url: Option<String>,
    pub refspecs: Vec<Refspec>,
    pub tags: TagPolicy,
    pub prune: bool,
    pub proxy: Option<String>,
    /// Whether any `remote.<name>.*` entry was present at all.
    pub found: bool,
}

/// Load a remote's configuration. Absent keys fall back: `prune` to
/// `fetch.prune`, the proxy to `http.proxy` and then the process
/// environment.
pub(crate) fn load<C: ConfigRead>(cx: &C, name: &str) -> Result<RemoteConfig, Error> {
    let url = cx.string(&key(name, "url")).map_err(Error::config)?;
    let push_url = cx.string(&key(name, "pushurl")).map_err(Error::config)?;

    let mut refspecs = Vec::new();
    let fetch = cx.multivar(&key(name, "fetch")).map_err(Error::config)?;
    let push = cx.multivar(&key(name, "push")).map_err(Error::config)?;
    let found =
        url.is_some() || push_url.is_some() || !fetch.is_empty() || !push.is_empty();
    for spec in fetch {
        refspecs.push(Refspec::parse(&spec, Direction::Fetch)?);
    }
    for spec in push {
        refspecs.push(Refspec::parse(&spec, Direction::Push)?);
    }

    let tags = match cx.string(&key(name, "tagopt")).map_err(Error::config)? {
        Some(opt) if opt == "--tags" => TagPolicy::All,
        Some(opt) if opt == "--no-tags" => TagPolicy::None,
        _ => TagPolicy::Auto,
    };

    let prune = match cx.boolean(&key(name, "prune")).map_err(Error::config)? {
        Some(prune) => prune,
        None => cx
            .boolean("fetch.prune")
            .map_err(Error::config)?
            .unwrap_or(false),
    };

    Ok(RemoteConfig {
        url,
        push_url,
        refspecs,
        tags,
        prune,
        proxy: proxy_for(cx, Some(name))?,
        found,
    })
}

/// Resolve the proxy for a remote: `remote.<name>.proxy`, then
/// `http.proxy`, then the `https_proxy` / `http_proxy` environment
/// (lowercase before uppercase).
pub(crate) fn proxy_for<C: ConfigRead>(cx: &C, name: Option<&str>) -> Result<Option<String>, Error> {
    if let Some(name) = name {
        if let Some(proxy) = cx.string(&key(name, "proxy")).map_err(Error::config)? {
            return Ok(Some(proxy));
        }
    }
    if let Some(proxy) = cx.string("http.proxy").map_err(Error::config)? {
        return Ok(Some(proxy));
    }
    Ok(proxy_from_env())
}

fn proxy_from_env() -> Option<String> {
    ["https_proxy", "http_proxy", "HTTPS_PROXY", "HTTP_PROXY"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

/// Canonicalize a remote URL. UNC paths are rewritten with forward
/// slashes for interoperability; everything else passes through.
pub(crate) fn canonicalize_url(url: &str) -> Result<String, Error> {
    if url.is_empty() {
        return Err(Error::Invalid("remote URL may not be empty".to_owned()));
    }
    if let Some(rest) = url.strip_prefix(r"\\") {
        return Ok(format!("//{}", rest.replace('\\', "/")));
    }
    Ok(url.to_owned())
}

/// Apply the configured `insteadof` rewrites to a URL.
///
/// Among all entries whose value is a prefix of `url`, the longest value
/// wins; on equal length, the earliest configured entry wins. The winning
/// prefix is replaced by the entry's `<prefix>` capture.
pub(crate) fn apply_insteadof<C: ConfigRead>(
    cx: &C,
    url: &str,
    direction: Direction,
) -> Result<String, Error> {
    let suffix = match direction {
        Direction::Fetch => ".insteadof",
        Direction::Push => ".pushinsteadof",
    };
    let mut best: Option<(usize, String)> = None;
    for (key, value) in cx
        .entries(&format!("url.*{suffix}"))
        .map_err(Error::config)?
    {
        let infix = key
            .strip_prefix("url.")
            .and_then(|rest| rest.strip_suffix(suffix));
        let Some(infix) = infix else { continue };
        if value.is_empty() || !url.starts_with(&value) {
            continue;
        }
        if best.as_ref().map_or(true, |(len, _)| value.len() > *len) {
            best = Some((value.len(), infix.to_owned()));
        }
    }
    Ok(match best {
        Some((len, infix)) => format!("{infix}{}", &url[len..]),
        None => url.to_owned(),
    })
}

/// A remote name is valid iff it yields a well-formed default fetch
/// refspec.
pub(crate) fn validate_remote_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || Refspec::default_fetch(name).is_err() {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Match a configuration key against a `*` glob.
pub(crate) fn glob_match(glob: &str, s: &str) -> bool {
    match glob.split_once('*') {
        None => glob == s,
        Some((prefix, rest)) => {
            let Some(s) = s.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            s.char_indices()
                .map(|(i, _)| i)
                .chain([s.len()])
                .any(|i| glob_match(rest, &s[i..]))
        }
    }
}
