//! The local object database, as consumed by remote operations.

use crate::Oid;

/// Object existence queries.
///
/// The remote core only ever asks whether an object is present: tag
/// auto-following and negotiation both hinge on local availability.
pub trait Odb {
    type Error: std::error::Error + Send + Sync + 'static;

    fn contains(&self, oid: Oid) -> Result<bool, Self::Error>;
}
