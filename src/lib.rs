//! Read-through, write-behind cache for bulk linked-data resource requests,
//! with log-driven invalidation.

pub mod bulk;
pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod invalidate;
