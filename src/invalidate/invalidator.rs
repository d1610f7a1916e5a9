//! Background consumer of the invalidation log.
//!
//! The invalidator joins a consumer group on the log, replays whatever it
//! left unacknowledged before a restart, then keeps reading new messages.
//! `Updated` and `Deleted` messages evict the resource in every configured
//! language before being acknowledged, so a crash in between only leads to a
//! repeated delete. Messages left pending by a failed eviction are retried
//! while running and again before shutdown; a consumer that still holds
//! pending messages stays registered so the next start replays them.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::message::{InvalidationMessage, MessageError};
use crate::cache::{
    CacheEntryRepository, GroupRead, ReadPosition, StoreError, StreamMessage,
};
use crate::config::InvalidationSettings;

const METRIC_PROCESSED: &str = "ldcache_invalidation_processed_total";
const METRIC_FAILED: &str = "ldcache_invalidation_failed_total";
const METRIC_IGNORED: &str = "ldcache_invalidation_ignored_total";
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Upper bound on a single blocking read; shutdown is observed between reads.
    pub block: Duration,
    pub batch_size: usize,
}

impl From<&InvalidationSettings> for InvalidationConfig {
    fn from(settings: &InvalidationSettings) -> Self {
        Self {
            stream: settings.stream.clone(),
            group: settings.group.clone(),
            consumer: settings.consumer.clone(),
            block: settings.block,
            batch_size: settings.batch_size.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidatorState {
    Uninitialized,
    GroupEnsured,
    ConsumerRegistered,
    Consuming,
    Draining,
}

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Applied and acknowledged.
    Processed,
    /// Unknown type; acknowledged without effect.
    Ignored,
    /// Not applied. Format errors are acknowledged, transient failures stay pending.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    pub processed: u64,
    pub ignored: u64,
    pub failed: u64,
}

impl InvalidationStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => {
                self.processed += 1;
                counter!(METRIC_PROCESSED).increment(1);
            }
            Outcome::Ignored => {
                self.ignored += 1;
                counter!(METRIC_IGNORED).increment(1);
            }
            Outcome::Failed => {
                self.failed += 1;
                counter!(METRIC_FAILED).increment(1);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("invalidation store failure: {0}")]
    Store(#[from] StoreError),
    #[error("malformed invalidation message: {0}")]
    Message(#[from] MessageError),
}

pub struct Invalidator {
    repository: CacheEntryRepository,
    config: InvalidationConfig,
    state: InvalidatorState,
    stats: InvalidationStats,
    /// Set when a message was left unacknowledged since the last replay.
    retry_pending: bool,
}

impl Invalidator {
    /// The repository's store carries both the log and the cache entries.
    pub fn new(repository: CacheEntryRepository, config: InvalidationConfig) -> Self {
        Self {
            repository,
            config,
            state: InvalidatorState::Uninitialized,
            stats: InvalidationStats::default(),
            retry_pending: false,
        }
    }

    pub fn state(&self) -> InvalidatorState {
        self.state
    }

    pub fn stats(&self) -> InvalidationStats {
        self.stats
    }

    pub fn config(&self) -> &InvalidationConfig {
        &self.config
    }

    /// Create the log and consumer group when missing. New groups start at the tail.
    pub async fn ensure_group(&mut self) -> Result<(), StoreError> {
        let store = self.repository.store();
        let (stream, group) = (&self.config.stream, &self.config.group);
        if !store.group_exists(stream, group).await? {
            info!(stream = %stream, group = %group, "Creating invalidation consumer group");
            store.create_group(stream, group).await?;
        }
        self.state = InvalidatorState::GroupEnsured;
        Ok(())
    }

    /// Register this consumer; returns `false` when it was already known.
    pub async fn register_consumer(&mut self) -> Result<bool, StoreError> {
        let store = self.repository.store();
        let InvalidationConfig {
            stream,
            group,
            consumer,
            ..
        } = &self.config;
        let created = if store.consumer_exists(stream, group, consumer).await? {
            false
        } else {
            store.create_consumer(stream, group, consumer).await?
        };
        debug!(
            stream = %stream,
            group = %group,
            consumer = %consumer,
            created,
            "Registered consumer"
        );
        self.state = InvalidatorState::ConsumerRegistered;
        Ok(created)
    }

    /// Ensure the group and consumer exist.
    pub async fn setup(&mut self) -> Result<(), StoreError> {
        self.ensure_group().await?;
        self.register_consumer().await?;
        Ok(())
    }

    /// Apply one message and acknowledge it unless the failure is transient.
    pub async fn process(&mut self, message: &StreamMessage) -> Outcome {
        let outcome = match InvalidationMessage::try_from(message) {
            Ok(parsed) if parsed.kind.invalidates() => self.evict(&parsed).await,
            Ok(parsed) => {
                info!(
                    message_id = %parsed.id,
                    kind = %parsed.kind,
                    "Ignoring invalidation message of unknown type"
                );
                self.ack(&message.id, Outcome::Ignored).await
            }
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "Dropping malformed invalidation message");
                self.ack(&message.id, Outcome::Failed).await
            }
        };
        self.stats.record(outcome);
        outcome
    }

    async fn evict(&mut self, message: &InvalidationMessage) -> Outcome {
        match self.repository.evict(&message.resource).await {
            Ok(removed) => {
                debug!(
                    message_id = %message.id,
                    iri = %message.resource,
                    kind = %message.kind,
                    removed,
                    "Evicted resource"
                );
                self.ack(&message.id, Outcome::Processed).await
            }
            Err(err) => {
                warn!(
                    message_id = %message.id,
                    iri = %message.resource,
                    error = %err,
                    "Eviction failed; leaving message pending"
                );
                self.retry_pending = true;
                Outcome::Failed
            }
        }
    }

    async fn ack(&mut self, id: &str, outcome: Outcome) -> Outcome {
        let ids = [id.to_string()];
        match self
            .repository
            .store()
            .ack(&self.config.stream, &self.config.group, &ids)
            .await
        {
            Ok(_) => outcome,
            Err(err) => {
                warn!(message_id = %id, error = %err, "Failed to acknowledge invalidation message");
                self.retry_pending = true;
                Outcome::Failed
            }
        }
    }

    async fn read(
        &self,
        position: ReadPosition,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        self.repository
            .store()
            .read_group(GroupRead {
                stream: &self.config.stream,
                group: &self.config.group,
                consumer: &self.config.consumer,
                position,
                count: self.config.batch_size,
                block,
            })
            .await
    }

    /// Process messages delivered to this consumer before but never acknowledged.
    ///
    /// Each pending message is attempted once; returns how many were seen.
    pub async fn drain_pending(&mut self) -> Result<usize, StoreError> {
        let mut after = ReadPosition::pending();
        let mut seen = 0;
        self.retry_pending = false;
        loop {
            let batch = match self.read(after, None).await {
                Ok(batch) => batch,
                Err(err) => {
                    self.retry_pending = true;
                    return Err(err);
                }
            };
            let Some(last) = batch.last() else {
                break;
            };
            after = ReadPosition::Pending(last.id.clone());
            seen += batch.len();
            for message in &batch {
                self.process(message).await;
            }
        }
        if seen > 0 {
            info!(consumer = %self.config.consumer, seen, "Replayed pending invalidation messages");
        }
        Ok(seen)
    }

    /// Replay pending messages if an earlier one failed, then read and
    /// process at most one batch of new messages.
    pub async fn poll(&mut self) -> Result<usize, StoreError> {
        if self.retry_pending {
            self.drain_pending().await?;
        }
        let batch = self
            .read(ReadPosition::New, Some(self.config.block))
            .await?;
        for message in &batch {
            self.process(message).await;
        }
        Ok(batch.len())
    }

    /// Consume until `shutdown` resolves, replay what is still pending, then
    /// deregister this consumer.
    ///
    /// Setup failures abort before consuming. Deregistration is attempted in
    /// every case and skipped while messages remain unacknowledged.
    #[instrument(
        skip_all,
        fields(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer
        )
    )]
    pub async fn run<F>(mut self, shutdown: F) -> Result<InvalidationStats, InvalidationError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let result = self.consume(&mut shutdown).await;

        self.state = InvalidatorState::Draining;
        if let Err(err) = self.drain_pending().await {
            warn!(error = %err, "Failed to replay pending messages before shutdown");
        }
        match self.deregister().await {
            Ok(true) => info!("Deregistered invalidation consumer"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "Failed to deregister invalidation consumer"),
        }

        result.map(|()| self.stats)
    }

    async fn consume<F>(&mut self, shutdown: &mut Pin<&mut F>) -> Result<(), InvalidationError>
    where
        F: Future<Output = ()>,
    {
        self.setup().await?;
        self.drain_pending().await?;
        self.state = InvalidatorState::Consuming;
        info!("Consuming invalidation log");

        let mut retry_delay = INITIAL_RETRY_DELAY;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => return Ok(()),
                result = self.poll() => match result {
                    Ok(_) => retry_delay = INITIAL_RETRY_DELAY,
                    Err(StoreError::MissingGroup { stream, group }) => {
                        warn!(stream = %stream, group = %group, "Consumer group vanished; recreating");
                        self.setup().await?;
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            retry_in_ms = retry_delay.as_millis() as u64,
                            "Reading invalidation log failed"
                        );
                        tokio::select! {
                            biased;
                            _ = shutdown.as_mut() => return Ok(()),
                            _ = tokio::time::sleep(retry_delay) => {}
                        }
                        retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                    }
                },
            }
        }
    }

    /// Remove this consumer from the group unless it still holds
    /// unacknowledged messages, which deregistration would discard.
    ///
    /// Returns whether the consumer was removed.
    pub async fn deregister(&mut self) -> Result<bool, StoreError> {
        let store = self.repository.store();
        let InvalidationConfig {
            stream,
            group,
            consumer,
            ..
        } = &self.config;
        let pending = store.pending_count(stream, group, consumer).await?;
        if pending > 0 {
            warn!(
                consumer = %consumer,
                pending,
                "Keeping consumer registered; its pending messages replay on the next start"
            );
            return Ok(false);
        }
        store.delete_consumer(stream, group, consumer).await?;
        Ok(true)
    }
}
