//! Catalog lock mode selection.

/// Conflict class requested when resolving a catalog row.
///
/// [`LockMode::Share`] lets the lookup proceed concurrently with other
/// readers; [`LockMode::Exclusive`] excludes concurrent DDL for the duration
/// of the lookup, so the returned row cannot be dropped or altered out from
/// under the caller before it acts on the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access; concurrent reads allowed.
    Share,
    /// Exclusive access; excludes concurrent create/alter/drop.
    Exclusive,
}
