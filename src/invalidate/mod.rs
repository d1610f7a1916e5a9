//! Cache invalidation driven by a durable mutation log.
//!
//! Producers append `{type, resource}` messages with
//! [`InvalidationPublisher`]; [`Invalidator`] consumes them through a
//! consumer group and evicts the affected cache entries.

mod invalidator;
mod message;
mod publisher;

pub use invalidator::{
    InvalidationConfig, InvalidationError, InvalidationStats, Invalidator, InvalidatorState,
    Outcome,
};
pub use message::{FIELD_RESOURCE, FIELD_TYPE, InvalidationMessage, MessageError, MessageKind};
pub use publisher::InvalidationPublisher;
