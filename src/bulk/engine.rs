//! Read-through, write-behind collection of bulk requests.

use std::sync::{Arc, Mutex};

use async_stream::stream;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tracing::{debug, instrument};

use super::authorize::{Authorizer, Pending};
use super::backend::{BackendError, HttpBackend};
use super::context::RequestContext;
use super::services::ServiceRegistry;
use crate::cache::{
    CacheConfig, CacheEntry, CacheEntryRepository, CacheRequest, CacheStore, ReadPartitioner,
    StoreError, WriteReport, mutex_lock,
};
use crate::config::Settings;

const SOURCE: &str = "bulk::engine";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cache store failed: {0}")]
    Store(#[from] StoreError),
    #[error("authorization failed: {0}")]
    Backend(#[from] BackendError),
}

impl EngineError {
    /// Response status an HTTP adapter should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Backend(_) => 502,
            EngineError::Store(_) => 503,
        }
    }
}

/// Authorized public entries, released only once authorization ran to completion.
#[derive(Debug, Clone, Default)]
pub struct WriteBack {
    state: Arc<Mutex<WriteBackState>>,
}

#[derive(Debug, Default)]
struct WriteBackState {
    entries: Vec<CacheEntry>,
    complete: bool,
}

impl WriteBack {
    fn completed(entries: Vec<CacheEntry>) -> Self {
        let write_back = Self::default();
        write_back.complete(entries);
        write_back
    }

    fn complete(&self, entries: Vec<CacheEntry>) {
        let mut state = mutex_lock(&self.state, SOURCE, "write_back.complete");
        state.entries = entries;
        state.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "write_back.is_complete").complete
    }

    /// The entries to persist, or `None` if the response stream was abandoned
    /// or failed before authorization finished.
    pub fn take(&self) -> Option<Vec<CacheEntry>> {
        let mut state = mutex_lock(&self.state, SOURCE, "write_back.take");
        state.complete.then(|| std::mem::take(&mut state.entries))
    }
}

/// Output of [`BulkCacheEngine::collect_resources`].
pub struct CollectedResources {
    /// Cached and authorized entries, merged as they become ready.
    pub resources: BoxStream<'static, Result<CacheEntry, EngineError>>,
    pub write_back: WriteBack,
    /// Whether every resource was served from the cache.
    pub entirely_public: bool,
}

#[derive(Clone)]
pub struct BulkCacheEngine {
    repository: CacheEntryRepository,
    partitioner: ReadPartitioner,
    authorizer: Authorizer,
}

impl BulkCacheEngine {
    pub fn new(repository: CacheEntryRepository, authorizer: Authorizer) -> Self {
        Self {
            partitioner: ReadPartitioner::new(repository.clone()),
            repository,
            authorizer,
        }
    }

    /// Wire an engine over `store` with an HTTP backend routed per `settings`.
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, BackendError> {
        let repository = CacheEntryRepository::new(store, CacheConfig::from(&settings.cache));
        let backend = HttpBackend::new(settings.backend.timeout)?;
        let resolver = ServiceRegistry::from_settings(&settings.backend);
        Ok(Self::new(
            repository,
            Authorizer::new(Arc::new(backend), Arc::new(resolver)),
        ))
    }

    pub fn repository(&self) -> &CacheEntryRepository {
        &self.repository
    }

    /// Partition `requested` against the cache and stream every resource.
    ///
    /// Fully public batches are answered from the cache alone. Otherwise
    /// cached public entries stream alongside the authorization of the rest;
    /// the order within each side is kept.
    #[instrument(
        skip_all,
        fields(lang = %ctx.language(), requested = requested.len())
    )]
    pub async fn collect_resources(
        &self,
        ctx: Arc<RequestContext>,
        requested: Vec<CacheRequest>,
    ) -> Result<CollectedResources, EngineError> {
        let partition = self
            .partitioner
            .partition(requested, ctx.language())
            .await?;

        if partition.entirely_public() {
            debug!(resources = partition.cached_public.len(), "Serving from cache only");
            return Ok(CollectedResources {
                resources: stream::iter(partition.cached_public.into_iter().map(Ok)).boxed(),
                write_back: WriteBack::completed(Vec::new()),
                entirely_public: true,
            });
        }

        let pending: Vec<Pending> = partition
            .not_cached
            .into_iter()
            .map(Pending::fresh)
            .chain(partition.cached_not_public.into_iter().map(Pending::stale))
            .collect();
        let mut backend_results = self.authorizer.authorize(ctx, pending);

        let write_back = WriteBack::default();
        let recorder = write_back.clone();
        let authorized = stream! {
            let mut public = Vec::new();
            while let Some(item) = backend_results.next().await {
                match item {
                    Ok(entry) => {
                        if entry.is_public() {
                            public.push(entry.clone());
                        }
                        yield Ok(entry);
                    }
                    Err(err) => {
                        yield Err(EngineError::from(err));
                        return;
                    }
                }
            }
            recorder.complete(public);
        };

        let cached = stream::iter(partition.cached_public.into_iter().map(Ok));
        Ok(CollectedResources {
            resources: stream::select(cached, authorized.boxed()).boxed(),
            write_back,
            entirely_public: false,
        })
    }

    /// Persist authorized entries for `lang`. Only public entries are written.
    ///
    /// Languages outside the configured set are never written: invalidation
    /// only evicts configured languages.
    #[instrument(skip_all, fields(lang = %lang, entries = entries.len()))]
    pub async fn write_back(&self, entries: &[CacheEntry], lang: &str) -> WriteReport {
        if !self.repository.config().supports_language(lang) {
            debug!("Skipping write-back for unconfigured language");
            return WriteReport::default();
        }
        let public: Vec<CacheEntry> = entries
            .iter()
            .filter(|entry| entry.is_public())
            .cloned()
            .collect();
        if public.is_empty() {
            return WriteReport::default();
        }
        let report = self.repository.set_many(&public, lang).await;
        debug!(written = report.written, failed = report.failed, "Wrote back authorized entries");
        report
    }

    /// Write back whatever `collected` released; nothing if it never completed.
    pub async fn finish(&self, write_back: &WriteBack, lang: &str) -> Option<WriteReport> {
        let entries = write_back.take()?;
        Some(self.write_back(&entries, lang).await)
    }
}
