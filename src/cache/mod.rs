//! Versioned response cache.
//!
//! Responses are stored per generation, one generation per deployed version,
//! keyed by normalized request identity. Generations are only ever removed
//! wholesale: there is no LRU and no size bound.

mod key;
mod storage;
mod store;
mod types;

pub use storage::SqliteStorage;
pub use store::{GenerationCache, PrecacheSummary, VersionedCacheStore};
pub use types::{CacheGeneration, MatchOptions};

#[cfg(test)]
pub use key::RequestKey;
#[cfg(test)]
pub use storage::CacheStorage;
#[cfg(test)]
pub use types::CachedEntry;
