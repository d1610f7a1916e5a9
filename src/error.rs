//! Top-level application error and failure reports.

use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    bulk::{BackendError, EngineError},
    cache::StoreError,
    config::LoadError,
    infra::error::InfraError,
    invalidate::InvalidationError,
};

/// Flattened view of an error and its causes, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }

    pub fn root_cause(&self) -> &str {
        self.messages.last().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Invalidation(#[from] InvalidationError),
}

impl AppError {
    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 78,
            AppError::Store(_) | AppError::Invalidation(InvalidationError::Store(_)) => 69,
            _ => 1,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("ldcache::error::AppError", self)
    }
}
