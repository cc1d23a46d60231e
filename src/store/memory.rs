//! In-process store client.
//!
//! [`MemoryStore`] mirrors the Redis semantics the queue relies on (empty
//! lists disappear, type mismatches are errors, blocking pops wake on push)
//! so the engine and the router can run without a server. Clones share
//! state, which lets a test keep a handle on a shard it handed to a router.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{prefixed, Connector, StoreClient};
use crate::config::ShardConfig;
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Entry {
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    SortedSet(HashMap<String, f64>),
    Str(String),
}

impl Entry {
    fn kind(&self) -> &'static str {
        match self {
            Entry::List(_) => "list",
            Entry::Set(_) => "set",
            Entry::SortedSet(_) => "zset",
            Entry::Str(_) => "string",
        }
    }
}

type Keyspace = HashMap<String, Entry>;

fn wrong_type(key: &str, entry: &Entry) -> StoreError {
    StoreError::WrongType(format!("{key} holds a {}", entry.kind()))
}

fn list_mut<'a>(space: &'a mut Keyspace, key: &str) -> Result<&'a mut VecDeque<String>, StoreError> {
    let entry = space
        .entry(key.to_string())
        .or_insert_with(|| Entry::List(VecDeque::new()));
    match entry {
        Entry::List(list) => Ok(list),
        other => Err(wrong_type(key, other)),
    }
}

fn list_ref<'a>(space: &'a Keyspace, key: &str) -> Result<Option<&'a VecDeque<String>>, StoreError> {
    match space.get(key) {
        None => Ok(None),
        Some(Entry::List(list)) => Ok(Some(list)),
        Some(other) => Err(wrong_type(key, other)),
    }
}

fn set_mut<'a>(space: &'a mut Keyspace, key: &str) -> Result<&'a mut BTreeSet<String>, StoreError> {
    let entry = space
        .entry(key.to_string())
        .or_insert_with(|| Entry::Set(BTreeSet::new()));
    match entry {
        Entry::Set(set) => Ok(set),
        other => Err(wrong_type(key, other)),
    }
}

/// Removes `key` if it holds an empty collection.
fn prune(space: &mut Keyspace, key: &str) {
    let empty = match space.get(key) {
        Some(Entry::List(list)) => list.is_empty(),
        Some(Entry::Set(set)) => set.is_empty(),
        Some(Entry::SortedSet(set)) => set.is_empty(),
        _ => false,
    };
    if empty {
        space.remove(key);
    }
}

fn pop_front(space: &mut Keyspace, key: &str) -> Result<Option<String>, StoreError> {
    if list_ref(space, key)?.is_none() {
        return Ok(None);
    }
    let value = list_mut(space, key)?.pop_front();
    prune(space, key);
    Ok(value)
}

fn pop_back(space: &mut Keyspace, key: &str) -> Result<Option<String>, StoreError> {
    if list_ref(space, key)?.is_none() {
        return Ok(None);
    }
    let value = list_mut(space, key)?.pop_back();
    prune(space, key);
    Ok(value)
}

/// Resolves Redis-style inclusive, possibly negative, range bounds.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// An in-memory store endpoint.
#[derive(Clone)]
pub struct MemoryStore {
    endpoint: String,
    prefix: String,
    space: Arc<Mutex<Keyspace>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_endpoint("memory", prefix)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            prefix: prefix.into(),
            space: Arc::new(Mutex::new(HashMap::new())),
            pushed: Arc::new(Notify::new()),
        }
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }

    /// Adds a member to a sorted set. Sorted sets are populated by external
    /// schedulers; the store trait itself only counts them.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let full = self.key(key);
        let mut space = self.space.lock().await;
        let entry = space
            .entry(full.clone())
            .or_insert_with(|| Entry::SortedSet(HashMap::new()));
        match entry {
            Entry::SortedSet(set) => Ok(set.insert(member.to_string(), score).is_none()),
            other => Err(wrong_type(&full, other)),
        }
    }

    /// Fully-qualified names of every key currently held.
    pub async fn keys(&self) -> Vec<String> {
        let space = self.space.lock().await;
        let mut keys: Vec<String> = space.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Contents of a list, head first. Missing keys read as empty.
    pub async fn list(&self, key: &str) -> Vec<String> {
        self.lrange(key, 0, -1).await.unwrap_or_default()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let len = {
            let mut space = self.space.lock().await;
            let list = list_mut(&mut space, &self.key(key))?;
            list.push_back(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut space = self.space.lock().await;
        pop_front(&mut space, &self.key(key))
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut space = self.space.lock().await;
        pop_back(&mut space, &self.key(key))
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>, StoreError> {
        let deadline = (timeout_secs > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_secs(timeout_secs));

        loop {
            // Register for wakeups before checking, so a push between the
            // check and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut space = self.space.lock().await;
                for key in keys {
                    let full = self.key(key);
                    if let Some(value) = pop_front(&mut space, &full)? {
                        return Ok(Some((full, value)));
                    }
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<String>, StoreError> {
        let (source, destination) = (self.key(source), self.key(destination));
        let moved = {
            let mut space = self.space.lock().await;
            // Check the destination type before mutating the source.
            list_ref(&space, &destination)?;
            match pop_back(&mut space, &source)? {
                Some(value) => {
                    list_mut(&mut space, &destination)?.push_front(value.clone());
                    Some(value)
                }
                None => None,
            }
        };
        if moved.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let space = self.space.lock().await;
        Ok(list_ref(&space, &self.key(key))?.map_or(0, |list| list.len() as u64))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let space = self.space.lock().await;
        let Some(list) = list_ref(&space, &self.key(key))? else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut space = self.space.lock().await;
        Ok(set_mut(&mut space, &self.key(key))?.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let full = self.key(key);
        let mut space = self.space.lock().await;
        let removed = match space.get_mut(&full) {
            None => false,
            Some(Entry::Set(set)) => set.remove(member),
            Some(other) => return Err(wrong_type(&full, other)),
        };
        prune(&mut space, &full);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let full = self.key(key);
        let space = self.space.lock().await;
        match space.get(&full) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(wrong_type(&full, other)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let full = self.key(key);
        let space = self.space.lock().await;
        match space.get(&full) {
            None => Ok(0),
            Some(Entry::SortedSet(set)) => Ok(set.len() as u64),
            Some(other) => Err(wrong_type(&full, other)),
        }
    }

    async fn del(&self, key: &str) -> Result<u64, StoreError> {
        let mut space = self.space.lock().await;
        Ok(u64::from(space.remove(&self.key(key)).is_some()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let full = self.key(key);
        let space = self.space.lock().await;
        match space.get(&full) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(other) => Err(wrong_type(&full, other)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut space = self.space.lock().await;
        space.insert(self.key(key), Entry::Str(value.to_string()));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let space = self.space.lock().await;
        Ok(space.contains_key(&self.key(key)))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let full = self.key(key);
        let mut space = self.space.lock().await;
        let current = match space.get(&full) {
            None => 0,
            Some(Entry::Str(value)) => value.parse::<i64>().map_err(|_| {
                StoreError::WrongType(format!("{full} does not hold an integer"))
            })?,
            Some(other) => return Err(wrong_type(&full, other)),
        };
        let next = current + delta;
        space.insert(full, Entry::Str(next.to_string()));
        Ok(next)
    }

    async fn execute(&self, command: &str, args: &[String]) -> Result<redis::Value, StoreError> {
        match command.to_ascii_uppercase().as_str() {
            "PING" => Ok(redis::Value::Status("PONG".to_string())),
            "ECHO" => match args.first() {
                Some(message) => Ok(redis::Value::Data(message.clone().into_bytes())),
                None => Err(StoreError::Unsupported("ECHO without a message".to_string())),
            },
            "DBSIZE" => {
                let space = self.space.lock().await;
                Ok(redis::Value::Int(space.len() as i64))
            }
            "FLUSHDB" => {
                self.space.lock().await.clear();
                Ok(redis::Value::Okay)
            }
            other => Err(StoreError::Unsupported(other.to_string())),
        }
    }
}

/// Hands out one [`MemoryStore`] per shard address. Connecting to the same
/// address twice yields clones sharing the same data, as two sockets to one
/// server would.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    prefix: String,
    stores: Arc<std::sync::Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryConnector {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            stores: Arc::default(),
        }
    }

    /// The store behind `address` (`host:port`), if it was ever connected.
    pub fn store(&self, address: &str) -> Option<MemoryStore> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores.get(address).cloned()
    }

    /// Every address connected so far, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let mut addresses: Vec<String> = stores.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, shard: &ShardConfig) -> Result<Arc<dyn StoreClient>, StoreError> {
        let address = shard.address();
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let store = stores
            .entry(address.clone())
            .or_insert_with(|| MemoryStore::with_endpoint(address, self.prefix.clone()))
            .clone();
        Ok(Arc::new(store))
    }
}
