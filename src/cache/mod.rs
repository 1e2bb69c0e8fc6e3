//! Key-value cache store boundary
//!
//! Provides the cache primitives the model layer is built on:
//! - Scalar strings with optional expiry
//! - Per-key field maps (hashes), with atomic batched reads and writes
//! - Unordered sets and ordered lists
//! - Sort-by-pattern that stores its result as a list
//!
//! Two stores implement it: a builtin in-memory store and a client for an
//! external Redis server.

pub mod config;
mod entry;
#[cfg(feature = "redis")]
mod redis_store;
mod store;

pub use config::{CacheConfig, CacheMode, RedisConfig};
pub use entry::{CacheEntry, CacheValue};
#[cfg(feature = "redis")]
pub use redis_store::RedisCacheStore;
pub use store::{CacheStats, CacheStore, CacheStoreError, InMemoryCacheStore, SortByPattern};
