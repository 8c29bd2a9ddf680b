//! Caching: a TTL key-value store, a typed service with hit/miss statistics,
//! and the GET response cache middleware built on them.

pub mod response;
pub mod store;

pub use response::{CachedBody, CachedResponse, RESPONSE_TTL, ResponseCacheMiddleware, cache_key, is_cacheable};
pub use store::{CacheError, CacheService, CacheStats, CacheStore, DEFAULT_TTL, MemoryCache};

#[cfg(test)]
pub(crate) use store::testing;
