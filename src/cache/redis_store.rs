//! Redis-backed [`CacheStore`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamInfoConsumersReply, StreamInfoGroupsReply, StreamReadOptions, StreamReadReply,
};
use tracing::debug;

use super::store::{CacheStore, GroupRead, StoreError, StreamMessage};

const BUSY_GROUP: &str = "BUSYGROUP";
const NO_GROUP: &str = "NOGROUP";
const STREAM_TAIL: &str = "$";

/// Store backed by a multiplexed, auto-reconnecting Redis connection.
///
/// Blocking stream reads occupy the shared connection for their duration, so
/// the invalidator should own a separate instance from request handlers.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!("Connected to redis");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn map_group_error(err: redis::RedisError, stream: &str, group: &str) -> StoreError {
    if err.code() == Some(NO_GROUP) {
        StoreError::MissingGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else {
        StoreError::Redis(err)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl_seconds(ttl))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn get_hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.hgetall::<_, HashMap<String, String>>(key).await?)
    }

    async fn set_hash(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(key)
            .ignore()
            .hset_multiple(key, fields)
            .ignore();
        if let Some(ttl) = ttl {
            let seconds = i64::try_from(ttl_seconds(ttl)).unwrap_or(i64::MAX);
            pipe.expire(key, seconds).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    // KEYS walks the whole keyspace; it is only used for administrative purges.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(conn.keys::<_, Vec<String>>(pattern).await?)
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StoreError> {
        let mut conn = self.conn();
        Ok(conn.xadd::<_, _, _, _, String>(stream, "*", fields).await?)
    }

    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(stream).await?;
        if !exists {
            return Ok(false);
        }
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(stream).await?;
        Ok(reply.groups.iter().any(|info| info.name == group))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, STREAM_TAIL)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some(BUSY_GROUP) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn consumer_exists(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let reply: StreamInfoConsumersReply = conn
            .xinfo_consumers(stream, group)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        Ok(reply.consumers.iter().any(|info| info.name == consumer))
    }

    async fn create_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let created: i64 = redis::cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        Ok(created == 1)
    }

    async fn read_group(&self, read: GroupRead<'_>) -> Result<Vec<StreamMessage>, StoreError> {
        let mut conn = self.conn();
        let mut options = StreamReadOptions::default()
            .group(read.group, read.consumer)
            .count(read.count);
        if let Some(block) = read.block {
            let millis = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
            options = options.block(millis.max(1));
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[read.stream], &[read.position.as_id()], &options)
            .await
            .map_err(|err| map_group_error(err, read.stream, read.group))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = HashMap::with_capacity(entry.map.len());
                for (name, value) in &entry.map {
                    let value: String = redis::from_redis_value(value).map_err(|err| {
                        StoreError::protocol(format!(
                            "field `{name}` of stream entry {} is not a string: {err}",
                            entry.id
                        ))
                    })?;
                    fields.insert(name.clone(), value);
                }
                messages.push(StreamMessage {
                    id: entry.id,
                    fields,
                });
            }
        }
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        Ok(conn.xack::<_, _, _, u64>(stream, group, ids).await?)
    }

    async fn pending_count(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let reply: StreamInfoConsumersReply = conn
            .xinfo_consumers(stream, group)
            .await
            .map_err(|err| map_group_error(err, stream, group))?;
        Ok(reply
            .consumers
            .iter()
            .find(|info| info.name == consumer)
            .map_or(0, |info| info.pending as u64))
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        conn.xgroup_delconsumer::<_, _, _, u64>(stream, group, consumer)
            .await
            .map_err(|err| map_group_error(err, stream, group))
    }
}
