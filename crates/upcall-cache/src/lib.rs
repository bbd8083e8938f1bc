//! A coalescing, bounded-lifetime cache for values resolved by an external
//! upcall. Concurrent lookups for the same key share a single in-flight
//! acquisition; the result is delivered asynchronously via `downcall`.

pub mod cache;
pub mod entry;
pub mod error;
pub mod ops;
pub(crate) mod table;

pub use cache::Cache;
pub use entry::{Entry, Flags, Settled};
pub use error::CacheError;
pub use ops::CacheOps;
