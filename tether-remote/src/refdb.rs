//! The local reference database, as consumed by remote operations.

use either::Either;
use git_ref_format::refspec::PatternStr;
use git_ref_format::{RefStr, RefString};

use crate::Oid;

/// Read and write access to local references.
///
/// Reference names passed in are validated; implementations never see a
/// name that fails the reference grammar. A reference points either
/// directly at an object ([`Either::Left`]) or symbolically at another
/// reference ([`Either::Right`]).
pub trait Refdb {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Look up a reference without peeling symbolic targets.
    fn find(&self, name: &RefStr) -> Result<Option<Either<Oid, RefString>>, Self::Error>;

    /// Peel `name` to an object id, following symbolic references.
    /// `None` if the reference does not exist.
    fn refname_to_id(&self, name: &RefStr) -> Result<Option<Oid>, Self::Error>;

    /// All references whose name matches `pattern` (a trailing `*`
    /// matches any suffix), with their targets.
    fn references_glob(
        &self,
        pattern: &PatternStr,
    ) -> Result<Vec<(RefString, Either<Oid, RefString>)>, Self::Error>;

    /// Create or overwrite a direct reference.
    fn set(&mut self, name: &RefStr, target: Oid, log: &str) -> Result<(), Self::Error>;

    /// Create or overwrite a symbolic reference.
    fn set_symbolic(&mut self, name: &RefStr, target: &RefStr, log: &str)
        -> Result<(), Self::Error>;

    /// Compare-and-set: update `name` to `target` iff it currently
    /// resolves to `expected` (`None` meaning it must not exist).
    ///
    /// Returns `Ok(false)` when the expectation does not hold; the
    /// reference is then left untouched.
    fn compare_and_set(
        &mut self,
        name: &RefStr,
        expected: Option<Oid>,
        target: Oid,
        log: &str,
    ) -> Result<bool, Self::Error>;

    /// Rename a reference, keeping its target.
    fn rename(&mut self, old: &RefStr, new: &RefStr, log: &str) -> Result<(), Self::Error>;

    /// Delete a reference. Deleting an absent reference is not an error.
    fn delete(&mut self, name: &RefStr) -> Result<(), Self::Error>;
}
