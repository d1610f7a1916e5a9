//! Bulk resource pipeline.
//!
//! A bulk request names many resource IRIs. [`BulkCacheEngine`] answers the
//! public cached ones straight from the cache, authorizes the remainder
//! through [`Authorizer`] against the owning backend services, streams both
//! as they become ready and hands back the public authorized entries for
//! write-back once the response is complete.

mod authorize;
mod backend;
mod blank_nodes;
mod context;
mod engine;
mod render;
mod services;

pub use authorize::{Authorizer, Pending};
pub use backend::{
    BULK_PATH, Backend, BackendError, BackendReply, HEXTUPLE_MEDIA_TYPE, HttpBackend,
    RawResource, bulk_form_body,
};
pub use blank_nodes::{new_scope, scope_blank_nodes};
pub use context::{RequestContext, RotatedCredentials};
pub use engine::{BulkCacheEngine, CollectedResources, EngineError, WriteBack};
pub use render::{META_GRAPH, STATUS_CODE_PREDICATE, render, render_entry, status_line};
pub use services::{
    Service, ServiceCapability, ServiceRegistry, ServiceResolver, resource_path,
};
