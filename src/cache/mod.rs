//! Read-through cache with per-entry TTL and pattern invalidation.
//!
//! - [`Cache`] is the shared in-memory store
//! - [`CacheScope`] embeds the owner identity into every key and offers the
//!   read-through [`CacheScope::fetch`]
//! - [`TtlTable`] is the fixed set of named lifetimes callers pick from

mod layer;
mod storage;
mod traits;

pub use layer::{owner_prefix, CacheScope};
pub use storage::Cache;
pub use traits::{CacheResult, CacheSource, TtlTable};
