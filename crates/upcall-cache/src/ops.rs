//! The capability set an embedding subsystem supplies to a [`crate::Cache`].
//!
//! Each hook's blocking contract matches the reference's
//! `struct upcall_cache_ops`: the compare hooks and `init_entry` run under
//! the cache's lock and must be fast and non-blocking; `do_upcall` and
//! `parse_downcall` run with the lock released and may block briefly.
//! None of the hooks may call back into the same cache (enforced by
//! contract, not detected at runtime).

use crate::entry::Entry;
use crate::error::CacheError;

/// Operation hooks parameterized by the cached value type `V` and the
/// caller-supplied argument type `A` (disambiguation data beyond the raw
/// key, e.g. a uid plus a generation number).
pub trait CacheOps<V, A>: Send + Sync {
    /// Called once, synchronously, when a `New` entry is allocated, before
    /// it is linked into the table. The payload itself cannot be set here
    /// — it is only ever written once, by a successful downcall — so this
    /// hook is for embedder-side bookkeeping (e.g. metrics, logging
    /// context) keyed off `args`; must not block.
    fn init_entry(&self, _entry: &Entry<V>, _args: &A) {}

    /// Called once, under the lock, immediately before an entry is
    /// deallocated. Release any payload-external resources here; must not
    /// block.
    fn free_entry(&self, _entry: &Entry<V>) {}

    /// Lookup match refinement beyond key equality. The cache has already
    /// checked `entry.key() == key`; this hook may narrow further (e.g.
    /// reject if `args` names a different namespace). Defaults to
    /// accepting any key match.
    fn upcall_compare(&self, _entry: &Entry<V>, _key: u64, _args: &A) -> bool {
        true
    }

    /// Downcall routing refinement, analogous to `upcall_compare` but
    /// evaluated when an external result arrives. May be looser or
    /// stricter than `upcall_compare`. Defaults to accepting any key
    /// match.
    fn downcall_compare(&self, _entry: &Entry<V>, _key: u64, _args: &A) -> bool {
        true
    }

    /// Dispatches the external resolver for `entry`. May block briefly
    /// (e.g. to hand a request off to a helper process) but must not wait
    /// for the result — the result arrives later via `Cache::downcall`,
    /// possibly on a different thread. `Ok(())` means "delivery will
    /// arrive via downcall"; `Err` is a synchronous dispatch failure.
    fn do_upcall(&self, entry: &Entry<V>) -> Result<(), CacheError>;

    /// Applies a downcall's raw result to produce the entry's payload.
    /// May block. Returning `Err` marks the entry `Invalid` instead of
    /// `Valid`.
    fn parse_downcall(&self, entry: &Entry<V>, args: &A) -> Result<V, CacheError>;
}
