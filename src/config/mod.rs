//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::NonZeroUsize,
    path::Path,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{CliArgs, Command, GlobalOverrides, InvalidateArgs, PublishArgs, PublishKind};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ldcache";
const ENV_PREFIX: &str = "LDCACHE";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_KEY_PREFIX: &str = "cache";
const DEFAULT_LANGUAGES: [&str; 3] = ["en", "nl", "de"];
const DEFAULT_READ_CONCURRENCY: u64 = 16;
const DEFAULT_STREAM: &str = "transactions";
const DEFAULT_GROUP: &str = "cache";
const DEFAULT_BLOCK_MS: u64 = 5_000;
const DEFAULT_BATCH_SIZE: u64 = 100;
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub invalidation: InvalidationSettings,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub key_prefix: Vec<String>,
    pub languages: Vec<String>,
    pub entry_ttl: Option<Duration>,
    pub read_concurrency: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct InvalidationSettings {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub block: Duration,
    pub batch_size: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub default_url: Url,
    pub default_bulk: bool,
    pub timeout: Duration,
    pub services: Vec<ServiceSettings>,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    /// Path prefix routed to this service, always starting with `/`.
    pub prefix: String,
    pub url: Url,
    pub bulk: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(environment());

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Invalidate(args)) = cli.command.as_ref() {
        raw.apply_invalidate_overrides(args);
    }

    Settings::from_raw(raw)
}

/// Load settings from a single file plus the environment, without CLI input.
pub fn load_file(path: &Path) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from(path).required(true))
        .add_source(environment())
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("cache.languages")
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    redis: RawRedisSettings,
    cache: RawCacheSettings,
    invalidation: RawInvalidationSettings,
    backend: RawBackendSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(stream) = overrides.invalidation_stream.as_ref() {
            self.invalidation.stream = Some(stream.clone());
        }
    }

    fn apply_invalidate_overrides(&mut self, args: &InvalidateArgs) {
        if let Some(group) = args.group.as_ref() {
            self.invalidation.group = Some(group.clone());
        }
        if let Some(consumer) = args.consumer.as_ref() {
            self.invalidation.consumer = Some(consumer.clone());
        }
        if let Some(block_ms) = args.block_ms {
            self.invalidation.block_ms = Some(block_ms);
        }
        if let Some(batch_size) = args.batch_size {
            self.invalidation.batch_size = Some(batch_size);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            redis,
            cache,
            invalidation,
            backend,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            redis: build_redis_settings(redis)?,
            cache: build_cache_settings(cache)?,
            invalidation: build_invalidation_settings(invalidation)?,
            backend: build_backend_settings(backend)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = non_blank(redis.url).unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    let parsed = Url::parse(&url)
        .map_err(|err| LoadError::invalid("redis.url", format!("invalid url `{url}`: {err}")))?;
    if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
        return Err(LoadError::invalid(
            "redis.url",
            format!("unsupported scheme `{}`", parsed.scheme()),
        ));
    }
    Ok(RedisSettings { url })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let prefix = non_blank(cache.key_prefix).unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
    let key_prefix: Vec<String> = prefix
        .split(crate::cache::KEY_SEPARATOR)
        .map(|segment| segment.trim().to_string())
        .collect();
    if key_prefix.iter().any(String::is_empty) {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "segments must not be empty",
        ));
    }

    let languages: Vec<String> = match cache.languages {
        Some(languages) => languages
            .into_iter()
            .map(|lang| lang.trim().to_string())
            .filter(|lang| !lang.is_empty())
            .collect(),
        None => DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
    };
    if languages.is_empty() {
        return Err(LoadError::invalid(
            "cache.languages",
            "at least one language is required",
        ));
    }

    let entry_ttl = match cache.entry_ttl_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.entry_ttl_seconds",
                "must be greater than zero when set",
            ));
        }
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => None,
    };

    let read_concurrency = non_zero(
        cache.read_concurrency.unwrap_or(DEFAULT_READ_CONCURRENCY),
        "cache.read_concurrency",
    )?;

    Ok(CacheSettings {
        key_prefix,
        languages,
        entry_ttl,
        read_concurrency,
    })
}

fn build_invalidation_settings(
    invalidation: RawInvalidationSettings,
) -> Result<InvalidationSettings, LoadError> {
    let stream = non_blank(invalidation.stream).unwrap_or_else(|| DEFAULT_STREAM.to_string());
    let group = non_blank(invalidation.group).unwrap_or_else(|| DEFAULT_GROUP.to_string());
    let consumer = non_blank(invalidation.consumer).unwrap_or_else(default_consumer_name);

    let block_ms = invalidation.block_ms.unwrap_or(DEFAULT_BLOCK_MS);
    if block_ms == 0 {
        return Err(LoadError::invalid(
            "invalidation.block_ms",
            "must be greater than zero",
        ));
    }

    let batch_size = non_zero(
        invalidation.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        "invalidation.batch_size",
    )?;

    Ok(InvalidationSettings {
        stream,
        group,
        consumer,
        block: Duration::from_millis(block_ms),
        batch_size,
    })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let default_url = non_blank(backend.default_url)
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
    let default_url = parse_http_url(&default_url, "backend.default_url")?;

    let timeout_secs = backend
        .timeout_seconds
        .unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "backend.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let services = backend
        .services
        .into_iter()
        .map(build_service_settings)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BackendSettings {
        default_url,
        default_bulk: backend.default_bulk.unwrap_or(false),
        timeout: Duration::from_secs(timeout_secs),
        services,
    })
}

fn build_service_settings(service: RawServiceSettings) -> Result<ServiceSettings, LoadError> {
    let name = non_blank(service.name)
        .ok_or_else(|| LoadError::invalid("backend.services.name", "must not be empty"))?;
    let prefix = non_blank(service.prefix).ok_or_else(|| {
        LoadError::invalid(
            "backend.services.prefix",
            format!("service `{name}` needs a path prefix"),
        )
    })?;
    let prefix = if prefix.starts_with('/') {
        prefix
    } else {
        format!("/{prefix}")
    };
    let url = non_blank(service.url).ok_or_else(|| {
        LoadError::invalid(
            "backend.services.url",
            format!("service `{name}` needs a url"),
        )
    })?;

    Ok(ServiceSettings {
        url: parse_http_url(&url, "backend.services.url")?,
        bulk: service.bulk.unwrap_or(false),
        name,
        prefix,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    key_prefix: Option<String>,
    languages: Option<Vec<String>>,
    entry_ttl_seconds: Option<u64>,
    read_concurrency: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInvalidationSettings {
    stream: Option<String>,
    group: Option<String>,
    consumer: Option<String>,
    block_ms: Option<u64>,
    batch_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    default_url: Option<String>,
    default_bulk: Option<bool>,
    timeout_seconds: Option<u64>,
    services: Vec<RawServiceSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServiceSettings {
    name: Option<String>,
    prefix: Option<String>,
    url: Option<String>,
    bulk: Option<bool>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn parse_http_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(value)
        .map_err(|err| LoadError::invalid(key, format!("invalid url `{value}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{}`", url.scheme()),
        ));
    }
    Ok(url)
}

fn default_consumer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .and_then(|host| non_blank(Some(host)))
        .unwrap_or_else(|| format!("ldcache-{}", uuid::Uuid::new_v4()))
}
