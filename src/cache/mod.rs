//! Resource cache.
//!
//! Stores authorized linked-data resources per `(iri, language)` in a
//! Redis-style hash store:
//!
//! - [`KeyCodec`] maps `(prefix, iri, language)` to store keys and back
//! - [`CacheEntryRepository`] reads and writes [`CacheEntry`] records
//! - [`ReadPartitioner`] classifies a requested batch into misses, stale
//!   non-public entries and servable public entries
//!
//! [`CacheStore`] abstracts the store itself; [`RedisStore`] is the production
//! implementation and [`MemoryStore`] the in-process one.

mod config;
mod entry;
mod keys;
mod lock;
mod memory;
mod partition;
mod redis_store;
mod repository;
mod store;

pub use config::CacheConfig;
pub use entry::{CacheControl, CacheEntry, CacheRequest, UnknownCacheControl};
pub use keys::{ENTRY_SEGMENT, KEY_SEPARATOR, KeyCodec};
pub use memory::MemoryStore;
pub use partition::{Lookup, ReadPartitioner, ReadResult};
pub use redis_store::RedisStore;
pub use repository::{CacheEntryRepository, WriteReport};
pub use store::{CacheStore, GroupRead, ReadPosition, StoreError, StreamMessage};

pub(crate) use lock::mutex_lock;
