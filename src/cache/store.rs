//! Shared store contract.
//!
//! The cache and the invalidation log live in a Redis-style store: plain
//! string values, hashes of fields, and append-only streams read through
//! consumer groups. [`CacheStore`] is the minimal surface the rest of the
//! crate relies on; [`RedisStore`](super::RedisStore) backs it in production
//! and [`MemoryStore`](super::MemoryStore) in-process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("no such stream or consumer group: {stream}/{group}")]
    MissingGroup { stream: String, group: String },
    #[error("unexpected store reply: {message}")]
    Protocol { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Which messages a group read returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPosition {
    /// Messages already delivered to this consumer but not acknowledged,
    /// with ids greater than the given one.
    Pending(String),
    /// Messages never delivered to any consumer of the group (`>`).
    New,
}

impl ReadPosition {
    /// Start of this consumer's pending list.
    pub fn pending() -> Self {
        ReadPosition::Pending("0".to_string())
    }

    pub fn as_id(&self) -> &str {
        match self {
            ReadPosition::Pending(id) => id,
            ReadPosition::New => ">",
        }
    }
}

/// One entry of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Options for a consumer-group read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRead<'a> {
    pub stream: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub position: ReadPosition,
    pub count: usize,
    /// How long to wait for new messages; `None` returns immediately.
    pub block: Option<Duration>,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key of any kind; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All fields of a hash; empty when the key is absent.
    async fn get_hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Replace a hash with exactly the given fields; the expiry is reset to `ttl`.
    async fn set_hash(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Keys matching a glob pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Append a message to a stream, creating it when needed; returns the id.
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StoreError>;

    /// Whether `stream` exists and has a consumer group named `group`.
    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, StoreError>;

    /// Create a consumer group at the stream's tail, creating the stream when
    /// needed. Messages appended earlier are never delivered to it.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    async fn consumer_exists(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool, StoreError>;

    /// Register a consumer; returns `false` when it was already present.
    async fn create_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool, StoreError>;

    async fn read_group(&self, read: GroupRead<'_>) -> Result<Vec<StreamMessage>, StoreError>;

    /// Acknowledge messages; returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError>;

    /// Messages delivered to `consumer` and not yet acknowledged.
    async fn pending_count(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StoreError>;

    /// Remove a consumer from its group; returns the number of messages it
    /// still had pending. Those messages are dropped with it.
    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StoreError>;
}
