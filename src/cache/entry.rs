//! Cache request and entry records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single resource asked for by a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheRequest {
    pub iri: String,
}

impl CacheRequest {
    pub fn new(iri: impl Into<String>) -> Self {
        Self { iri: iri.into() }
    }
}

impl From<&str> for CacheRequest {
    fn from(iri: &str) -> Self {
        Self::new(iri)
    }
}

impl From<String> for CacheRequest {
    fn from(iri: String) -> Self {
        Self { iri }
    }
}

/// Governs whether a cached body may be served to other requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheControl {
    #[default]
    None,
    Public,
    Private,
    NoCache,
}

impl CacheControl {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheControl::None => "none",
            CacheControl::Public => "public",
            CacheControl::Private => "private",
            CacheControl::NoCache => "no-cache",
        }
    }

    pub fn is_public(self) -> bool {
        matches!(self, CacheControl::Public)
    }

    /// Derive visibility from an HTTP `Cache-Control` header value.
    ///
    /// The most restrictive directive wins.
    pub fn from_header(value: &str) -> Self {
        let directives: Vec<String> = value
            .split(',')
            .map(|directive| directive.trim().to_ascii_lowercase())
            .collect();
        let has = |name: &str| directives.iter().any(|d| d == name);

        if has("no-cache") || has("no-store") {
            CacheControl::NoCache
        } else if has("private") {
            CacheControl::Private
        } else if has("public") {
            CacheControl::Public
        } else {
            CacheControl::None
        }
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cache control `{0}`")]
pub struct UnknownCacheControl(pub String);

impl FromStr for CacheControl {
    type Err = UnknownCacheControl;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(CacheControl::None),
            "public" => Ok(CacheControl::Public),
            "private" => Ok(CacheControl::Private),
            "no-cache" | "nocache" => Ok(CacheControl::NoCache),
            _ => Err(UnknownCacheControl(value.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for CacheControl {
    /// Unrecognised values deserialize as [`CacheControl::None`].
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().unwrap_or_default())
    }
}

/// A resolved resource, either read from the store or freshly authorized.
///
/// `contents` is `None` for non-OK statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub iri: String,
    pub status: u16,
    pub cache_control: CacheControl,
    pub contents: Option<String>,
}

impl CacheEntry {
    pub fn new(
        iri: impl Into<String>,
        status: u16,
        cache_control: CacheControl,
        contents: Option<String>,
    ) -> Self {
        Self {
            iri: iri.into(),
            status,
            cache_control,
            contents,
        }
    }

    /// Entry that reports `status` without a body and must not be reused.
    pub fn failed(iri: impl Into<String>, status: u16) -> Self {
        Self::new(iri, status, CacheControl::NoCache, None)
    }

    pub fn is_public(&self) -> bool {
        self.cache_control.is_public()
    }

    /// A public entry with a non-empty body can be served from the cache as-is.
    pub fn is_servable(&self) -> bool {
        self.is_public() && self.contents.as_deref().is_some_and(|c| !c.is_empty())
    }

    pub fn request(&self) -> CacheRequest {
        CacheRequest::new(self.iri.clone())
    }
}
