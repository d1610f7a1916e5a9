//! In-process [`CacheStore`].
//!
//! Mirrors the subset of Redis semantics the crate relies on: expiring
//! strings and hashes, glob key listing, and streams with consumer groups,
//! per-consumer pending lists and blocking reads. Faults can be injected per
//! key to exercise failure paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::lock::mutex_lock;
use super::store::{CacheStore, GroupRead, ReadPosition, StoreError, StreamMessage};

const SOURCE: &str = "cache::memory";

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    faults: Mutex<Vec<String>>,
    appended: Notify,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Slot>,
    streams: HashMap<String, MemoryStream>,
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Default)]
struct MemoryStream {
    entries: Vec<(u64, HashMap<String, String>)>,
    last_seq: u64,
    groups: HashMap<String, MemoryGroup>,
}

#[derive(Default)]
struct MemoryGroup {
    last_delivered: u64,
    consumers: HashMap<String, BTreeSet<u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every key operation on a key containing `needle` fail.
    pub fn inject_fault(&self, needle: impl Into<String>) {
        mutex_lock(&self.faults, SOURCE, "inject_fault").push(needle.into());
    }

    pub fn clear_faults(&self) {
        mutex_lock(&self.faults, SOURCE, "clear_faults").clear();
    }

    /// Number of messages currently held in `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        mutex_lock(&self.inner, SOURCE, "stream_len")
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    /// Pending message ids per consumer of `group`.
    pub fn pending(&self, stream: &str, group: &str) -> HashMap<String, Vec<String>> {
        let inner = mutex_lock(&self.inner, SOURCE, "pending");
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| {
                g.consumers
                    .iter()
                    .map(|(name, seqs)| (name.clone(), seqs.iter().map(|s| format_id(*s)).collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_fault(&self, key: &str) -> Result<(), StoreError> {
        let faults = mutex_lock(&self.faults, SOURCE, "check_fault");
        match faults.iter().find(|needle| key.contains(needle.as_str())) {
            Some(needle) => Err(StoreError::unavailable(format!(
                "injected fault `{needle}` for key `{key}`"
            ))),
            None => Ok(()),
        }
    }

    fn try_read(&self, read: &GroupRead<'_>) -> Result<Vec<StreamMessage>, StoreError> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "read_group");
        let missing = || StoreError::MissingGroup {
            stream: read.stream.to_string(),
            group: read.group.to_string(),
        };
        let stream = inner.streams.get_mut(read.stream).ok_or_else(missing)?;
        let group = stream.groups.get_mut(read.group).ok_or_else(missing)?;

        match &read.position {
            ReadPosition::New => {
                let fresh: Vec<(u64, HashMap<String, String>)> = stream
                    .entries
                    .iter()
                    .filter(|(seq, _)| *seq > group.last_delivered)
                    .take(read.count)
                    .cloned()
                    .collect();
                let pending = group.consumers.entry(read.consumer.to_string()).or_default();
                for (seq, _) in &fresh {
                    pending.insert(*seq);
                }
                if let Some((seq, _)) = fresh.last() {
                    group.last_delivered = *seq;
                }
                Ok(fresh
                    .into_iter()
                    .map(|(seq, fields)| StreamMessage {
                        id: format_id(seq),
                        fields,
                    })
                    .collect())
            }
            ReadPosition::Pending(after) => {
                let after = parse_id(after)?;
                let pending = group.consumers.entry(read.consumer.to_string()).or_default();
                Ok(pending
                    .range(after.saturating_add(1)..)
                    .take(read.count)
                    .map(|seq| StreamMessage {
                        id: format_id(*seq),
                        fields: stream
                            .entries
                            .iter()
                            .find(|(s, _)| s == seq)
                            .map(|(_, fields)| fields.clone())
                            .unwrap_or_default(),
                    })
                    .collect())
            }
        }
    }
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Result<u64, StoreError> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .ok_or_else(|| StoreError::protocol(format!("invalid stream id `{id}`")))
}

fn is_live(slot: &Slot, now: Instant) -> bool {
    slot.expires_at.is_none_or(|at| at > now)
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some(ch) if *ch == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|ch| *ch == '*')
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_fault(key)?;
        let inner = mutex_lock(&self.inner, SOURCE, "get");
        Ok(inner
            .values
            .get(key)
            .filter(|slot| is_live(slot, Instant::now()))
            .and_then(|slot| match &slot.value {
                Value::Text(text) => Some(text.clone()),
                Value::Hash(_) => None,
            }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_fault(key)?;
        let slot = Slot {
            value: Value::Text(value.to_string()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        mutex_lock(&self.inner, SOURCE, "set")
            .values
            .insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_fault(key)?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "delete");
        let removed_value = inner
            .values
            .remove(key)
            .is_some_and(|slot| is_live(&slot, Instant::now()));
        let removed_stream = inner.streams.remove(key).is_some();
        Ok(removed_value || removed_stream)
    }

    async fn get_hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_fault(key)?;
        let inner = mutex_lock(&self.inner, SOURCE, "get_hash");
        Ok(inner
            .values
            .get(key)
            .filter(|slot| is_live(slot, Instant::now()))
            .and_then(|slot| match &slot.value {
                Value::Hash(fields) => Some(fields.clone()),
                Value::Text(_) => None,
            })
            .unwrap_or_default())
    }

    async fn set_hash(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_fault(key)?;
        let slot = Slot {
            value: Value::Hash(
                fields
                    .iter()
                    .map(|(name, value)| ((*name).to_string(), value.clone()))
                    .collect(),
            ),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        mutex_lock(&self.inner, SOURCE, "set_hash")
            .values
            .insert(key.to_string(), slot);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let inner = mutex_lock(&self.inner, SOURCE, "keys");
        let mut keys: Vec<String> = inner
            .values
            .iter()
            .filter(|(_, slot)| is_live(slot, now))
            .map(|(key, _)| key)
            .chain(inner.streams.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String, StoreError> {
        self.check_fault(stream)?;
        let id = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "append");
            let target = inner.streams.entry(stream.to_string()).or_default();
            target.last_seq += 1;
            let seq = target.last_seq;
            target.entries.push((
                seq,
                fields
                    .iter()
                    .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
                    .collect(),
            ));
            format_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn group_exists(&self, stream: &str, group: &str) -> Result<bool, StoreError> {
        self.check_fault(stream)?;
        let inner = mutex_lock(&self.inner, SOURCE, "group_exists");
        Ok(inner
            .streams
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(group)))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        self.check_fault(stream)?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "create_group");
        let target = inner.streams.entry(stream.to_string()).or_default();
        let last_delivered = target.last_seq;
        target
            .groups
            .entry(group.to_string())
            .or_insert_with(|| MemoryGroup {
                last_delivered,
                consumers: HashMap::new(),
            });
        Ok(())
    }

    async fn consumer_exists(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool, StoreError> {
        self.check_fault(stream)?;
        let inner = mutex_lock(&self.inner, SOURCE, "consumer_exists");
        let group = inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| StoreError::MissingGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(group.consumers.contains_key(consumer))
    }

    async fn create_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool, StoreError> {
        self.check_fault(stream)?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "create_consumer");
        let target = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| StoreError::MissingGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        if target.consumers.contains_key(consumer) {
            return Ok(false);
        }
        target
            .consumers
            .insert(consumer.to_string(), BTreeSet::new());
        Ok(true)
    }

    async fn read_group(&self, read: GroupRead<'_>) -> Result<Vec<StreamMessage>, StoreError> {
        self.check_fault(read.stream)?;
        let deadline = read.block.map(|block| tokio::time::Instant::now() + block);

        loop {
            // Registered before the read so an append in between still wakes us.
            let appended = self.appended.notified();

            let batch = self.try_read(&read)?;
            if !batch.is_empty() || matches!(read.position, ReadPosition::Pending(_)) {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        self.check_fault(stream)?;
        let seqs = ids
            .iter()
            .map(|id| parse_id(id))
            .collect::<Result<Vec<u64>, StoreError>>()?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "ack");
        let Some(target) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let mut acked = 0;
        for seq in seqs {
            for pending in target.consumers.values_mut() {
                if pending.remove(&seq) {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn pending_count(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StoreError> {
        self.check_fault(stream)?;
        let inner = mutex_lock(&self.inner, SOURCE, "pending_count");
        let target = inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| StoreError::MissingGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(target
            .consumers
            .get(consumer)
            .map_or(0, |pending| pending.len() as u64))
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, StoreError> {
        self.check_fault(stream)?;
        let mut inner = mutex_lock(&self.inner, SOURCE, "delete_consumer");
        let target = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| StoreError::MissingGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(target
            .consumers
            .remove(consumer)
            .map_or(0, |pending| pending.len() as u64))
    }
}
