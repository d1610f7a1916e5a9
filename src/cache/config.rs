//! Cache configuration.
//!
//! Controls key layout, language fan-out and expiry of stored entries.

use std::num::NonZeroUsize;
use std::time::Duration;

use super::keys::KeyCodec;

const DEFAULT_KEY_PREFIX: &str = "cache";
const DEFAULT_LANGUAGES: [&str; 3] = ["en", "nl", "de"];
const DEFAULT_READ_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Leading key segments shared by every cache key.
    pub key_prefix: Vec<String>,
    /// Languages the cache is fragmented by; invalidation fans out over all of them.
    pub languages: Vec<String>,
    /// Expiry applied to written entries; `None` keeps them until invalidated.
    pub entry_ttl: Option<Duration>,
    /// Maximum concurrent store lookups per partitioned batch.
    pub read_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: vec![DEFAULT_KEY_PREFIX.to_string()],
            languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
            entry_ttl: None,
            read_concurrency: DEFAULT_READ_CONCURRENCY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            key_prefix: settings.key_prefix.clone(),
            languages: settings.languages.clone(),
            entry_ttl: settings.entry_ttl,
            read_concurrency: settings.read_concurrency.get(),
        }
    }
}

impl CacheConfig {
    pub fn key_codec(&self) -> KeyCodec {
        KeyCodec::new(self.key_prefix.iter().cloned())
    }

    /// Read concurrency clamped to at least one.
    pub fn read_concurrency_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.read_concurrency).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn supports_language(&self, lang: &str) -> bool {
        self.languages.iter().any(|l| l == lang)
    }
}
