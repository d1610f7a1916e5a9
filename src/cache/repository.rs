//! Reads and writes [`CacheEntry`] records as store hashes.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::{CacheControl, CacheEntry};
use super::keys::KeyCodec;
use super::store::{CacheStore, StoreError};

const FIELD_IRI: &str = "iri";
const FIELD_STATUS: &str = "status";
const FIELD_CACHE_CONTROL: &str = "cacheControl";
const FIELD_CONTENTS: &str = "contents";

const METRIC_ENTRY_HIT: &str = "ldcache_entry_hit_total";
const METRIC_ENTRY_MISS: &str = "ldcache_entry_miss_total";
const METRIC_ENTRY_MALFORMED: &str = "ldcache_entry_malformed_total";
const METRIC_WRITE_BACK: &str = "ldcache_write_back_total";
const METRIC_WRITE_BACK_FAILED: &str = "ldcache_write_back_failed_total";

/// Outcome of a best-effort batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CacheEntryRepository {
    store: Arc<dyn CacheStore>,
    codec: KeyCodec,
    config: CacheConfig,
}

impl CacheEntryRepository {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            codec: config.key_codec(),
            config,
        }
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Look up the entry for `iri` in `lang`.
    ///
    /// Missing keys and hashes lacking a required field both read as `None`.
    pub async fn get(&self, iri: &str, lang: &str) -> Result<Option<CacheEntry>, StoreError> {
        let key = self.codec.entry_key(iri, lang);
        let fields = self.store.get_hash(&key).await?;
        if fields.is_empty() {
            counter!(METRIC_ENTRY_MISS).increment(1);
            return Ok(None);
        }

        match decode_entry(fields) {
            Some(entry) => {
                counter!(METRIC_ENTRY_HIT).increment(1);
                Ok(Some(entry))
            }
            None => {
                debug!(key = %key, "Treating malformed cache record as a miss");
                counter!(METRIC_ENTRY_MALFORMED).increment(1);
                Ok(None)
            }
        }
    }

    /// Persist each entry under `lang`.
    ///
    /// Failures are logged and counted; they never abort the rest of the batch.
    pub async fn set_many(&self, entries: &[CacheEntry], lang: &str) -> WriteReport {
        let mut report = WriteReport::default();
        for entry in entries {
            let key = self.codec.entry_key(&entry.iri, lang);
            match self
                .store
                .set_hash(&key, &encode_entry(entry), self.config.entry_ttl)
                .await
            {
                Ok(()) => report.written += 1,
                Err(error) => {
                    warn!(key = %key, error = %error, "Failed to write cache entry");
                    report.failed += 1;
                }
            }
        }

        counter!(METRIC_WRITE_BACK).increment(report.written as u64);
        if report.failed > 0 {
            counter!(METRIC_WRITE_BACK_FAILED).increment(report.failed as u64);
        }
        report
    }

    /// Remove the entry for `iri` in every configured language.
    ///
    /// Returns how many keys existed.
    pub async fn evict(&self, iri: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for lang in &self.config.languages {
            let key = self.codec.entry_key(iri, lang);
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every cached entry under this prefix; returns the number removed.
    pub async fn purge(&self) -> Result<usize, StoreError> {
        let keys = self.store.keys(&self.codec.entry_pattern()).await?;
        let mut removed = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn encode_entry(entry: &CacheEntry) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        (FIELD_IRI, entry.iri.clone()),
        (FIELD_STATUS, entry.status.to_string()),
        (FIELD_CACHE_CONTROL, entry.cache_control.as_str().to_string()),
    ];
    if let Some(contents) = &entry.contents {
        fields.push((FIELD_CONTENTS, contents.clone()));
    }
    fields
}

fn decode_entry(mut fields: HashMap<String, String>) -> Option<CacheEntry> {
    let iri = fields.remove(FIELD_IRI)?;
    let status = fields.remove(FIELD_STATUS)?.parse().ok()?;
    let cache_control = fields
        .remove(FIELD_CACHE_CONTROL)?
        .parse::<CacheControl>()
        .ok()?;
    Some(CacheEntry {
        iri,
        status,
        cache_control,
        contents: fields.remove(FIELD_CONTENTS),
    })
}
