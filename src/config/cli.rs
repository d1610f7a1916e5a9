use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};

/// Command-line arguments for the ldcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "ldcache",
    version,
    about = "Linked-data resource cache and invalidation worker"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "LDCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Consume the invalidation log and evict stale entries until interrupted.
    Invalidate(InvalidateArgs),
    /// Append an invalidation message for a resource.
    Publish(PublishArgs),
    /// Delete every cached entry under the configured key prefix.
    Clear,
}

/// Overrides accepted by every command.
#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL", global = true)]
    pub redis_url: Option<String>,

    /// Override the stream carrying invalidation messages.
    #[arg(long = "invalidation-stream", value_name = "NAME", global = true)]
    pub invalidation_stream: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct InvalidateArgs {
    /// Override the consumer group name.
    #[arg(long = "group", value_name = "NAME")]
    pub group: Option<String>,

    /// Override this worker's consumer name.
    #[arg(long = "consumer", value_name = "NAME")]
    pub consumer: Option<String>,

    /// Override how long a single log read blocks.
    #[arg(long = "block-ms", value_name = "MILLIS")]
    pub block_ms: Option<u64>,

    /// Override how many messages are read at once.
    #[arg(long = "batch-size", value_name = "COUNT")]
    pub batch_size: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct PublishArgs {
    /// Kind of mutation to announce.
    #[arg(long = "kind", value_enum, default_value_t = PublishKind::Updated)]
    pub kind: PublishKind,

    /// IRI of the mutated resource.
    #[arg(value_name = "IRI")]
    pub iri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PublishKind {
    #[value(name = "Updated", alias = "updated")]
    Updated,
    #[value(name = "Deleted", alias = "deleted")]
    Deleted,
}
