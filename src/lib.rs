//! Cache-coherent model records over a relational store and a key-value cache.

pub mod cache;
pub mod cached;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod key;
pub mod model;
pub mod request;

pub use cache::{CacheConfig, CacheMode, CacheStore, CacheStoreError, InMemoryCacheStore};
#[cfg(feature = "redis")]
pub use cache::RedisCacheStore;
pub use cached::CachedModel;
pub use config::{init_logging, CacheModelConfig};
pub use context::StoreContext;
#[cfg(feature = "sqlite")]
pub use db::SqliteBackend;
pub use db::{DatabaseBackend, RecordId, Row};
pub use error::{Error, Result, ValidationErrors};
pub use key::{BuiltKey, CacheKeyBuilder, KeySpec, SortDirection, SortRequest, SortSpec};
pub use model::{EntityDefinition, FieldDefinition, FieldType, Model, Record, RecordStore};
pub use request::{Associable, AsyncRequest};
