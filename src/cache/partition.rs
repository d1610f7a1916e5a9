//! Classifies a requested batch by what the cache already holds.

use futures::{StreamExt, TryStreamExt, stream};
use tracing::debug;

use super::entry::{CacheEntry, CacheRequest};
use super::repository::CacheEntryRepository;
use super::store::StoreError;

/// Cache state of one requested resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Nothing usable is stored.
    NotCached(CacheRequest),
    /// Stored, but not servable to other requesters.
    CachedNotPublic(CacheEntry),
    /// Stored, public and non-empty.
    CachedPublic(CacheEntry),
}

impl Lookup {
    /// Classify the stored entry (if any) for `request`.
    ///
    /// An empty body counts as a miss, as does a public entry without one.
    pub fn classify(request: CacheRequest, found: Option<CacheEntry>) -> Self {
        match found {
            None => Lookup::NotCached(request),
            Some(entry) if entry.contents.as_deref() == Some("") => Lookup::NotCached(request),
            Some(entry) if !entry.is_public() => Lookup::CachedNotPublic(entry),
            Some(entry) if entry.contents.is_some() => Lookup::CachedPublic(entry),
            Some(_) => Lookup::NotCached(request),
        }
    }
}

/// A requested batch split into three disjoint lists, each in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub not_cached: Vec<CacheRequest>,
    pub cached_not_public: Vec<CacheEntry>,
    pub cached_public: Vec<CacheEntry>,
}

impl ReadResult {
    pub fn entirely_public(&self) -> bool {
        self.not_cached.is_empty() && self.cached_not_public.is_empty()
    }

    pub fn len(&self) -> usize {
        self.not_cached.len() + self.cached_not_public.len() + self.cached_public.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Lookup> for ReadResult {
    fn from_iter<I: IntoIterator<Item = Lookup>>(iter: I) -> Self {
        let (mut not_cached, mut cached_not_public, mut cached_public) =
            (Vec::new(), Vec::new(), Vec::new());
        for lookup in iter {
            match lookup {
                Lookup::NotCached(request) => not_cached.push(request),
                Lookup::CachedNotPublic(entry) => cached_not_public.push(entry),
                Lookup::CachedPublic(entry) => cached_public.push(entry),
            }
        }
        Self {
            not_cached,
            cached_not_public,
            cached_public,
        }
    }
}

#[derive(Clone)]
pub struct ReadPartitioner {
    repository: CacheEntryRepository,
}

impl ReadPartitioner {
    pub fn new(repository: CacheEntryRepository) -> Self {
        Self { repository }
    }

    /// Look up every requested resource concurrently and classify it.
    ///
    /// Any store failure fails the whole batch.
    pub async fn partition(
        &self,
        requested: Vec<CacheRequest>,
        lang: &str,
    ) -> Result<ReadResult, StoreError> {
        let concurrency = self.repository.config().read_concurrency_non_zero().get();
        let lookups: Vec<Lookup> = stream::iter(requested)
            .map(|request| async move {
                let found = self.repository.get(&request.iri, lang).await?;
                Ok::<_, StoreError>(Lookup::classify(request, found))
            })
            .buffered(concurrency)
            .try_collect()
            .await?;

        let result: ReadResult = lookups.into_iter().collect();
        debug!(
            lang,
            not_cached = result.not_cached.len(),
            cached_not_public = result.cached_not_public.len(),
            cached_public = result.cached_public.len(),
            "Partitioned bulk request"
        );
        Ok(result)
    }
}
