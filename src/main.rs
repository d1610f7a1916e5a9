use std::{process, sync::Arc};

use ldcache::{
    cache::{CacheConfig, CacheEntryRepository, CacheStore, RedisStore},
    config::{self, Command, PublishArgs, PublishKind, Settings},
    error::AppError,
    infra::telemetry,
    invalidate::{InvalidationConfig, InvalidationPublisher, Invalidator, MessageKind},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, causes = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, causes = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args
        .command
        .unwrap_or(Command::Invalidate(Default::default()))
    {
        Command::Invalidate(_) => run_invalidate(settings).await,
        Command::Publish(args) => run_publish(settings, args).await,
        Command::Clear => run_clear(settings).await,
    }
}

async fn connect(settings: &Settings) -> Result<Arc<dyn CacheStore>, AppError> {
    let store = RedisStore::connect(&settings.redis.url).await?;
    Ok(Arc::new(store))
}

fn repository(settings: &Settings, store: Arc<dyn CacheStore>) -> CacheEntryRepository {
    CacheEntryRepository::new(store, CacheConfig::from(&settings.cache))
}

async fn run_invalidate(settings: Settings) -> Result<(), AppError> {
    // Blocking group reads hold the connection; the invalidator gets its own.
    let store = connect(&settings).await?;
    let invalidator = Invalidator::new(
        repository(&settings, store),
        InvalidationConfig::from(&settings.invalidation),
    );

    let stats = invalidator.run(shutdown_signal()).await?;
    info!(
        processed = stats.processed,
        ignored = stats.ignored,
        failed = stats.failed,
        "Invalidation worker stopped"
    );
    Ok(())
}

async fn run_publish(settings: Settings, args: PublishArgs) -> Result<(), AppError> {
    let store = connect(&settings).await?;
    let publisher = InvalidationPublisher::new(store, settings.invalidation.stream.clone());
    let kind = match args.kind {
        PublishKind::Updated => MessageKind::Updated,
        PublishKind::Deleted => MessageKind::Deleted,
    };

    let id = publisher.publish(&kind, &args.iri).await?;
    info!(id = %id, kind = %kind, iri = %args.iri, "Published invalidation message");
    Ok(())
}

async fn run_clear(settings: Settings) -> Result<(), AppError> {
    let store = connect(&settings).await?;
    let removed = repository(&settings, store).purge().await?;
    info!(removed, "Cleared cache entries");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
