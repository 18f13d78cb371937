use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::store::{Store, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Entry {
    Str { value: String, expires: Option<Instant> },
    Set(HashSet<String>),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Zset(Vec<(String, f64)>),
}

/// In-process [`Store`] backing. All state lives behind a single mutex;
/// every trait method is one short critical section, so the linearizability
/// the key pool needs falls out for free.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Other("memory store poisoned".to_string()))
    }
}

fn live_str(entry: &Entry) -> Option<&str> {
    match entry {
        Entry::Str { value, expires } => {
            if expires.map(|at| at <= Instant::now()).unwrap_or(false) {
                None
            } else {
                Some(value.as_str())
            }
        }
        _ => None,
    }
}

macro_rules! typed_entry {
    ($guard:expr, $key:expr, $variant:ident, $default:expr) => {{
        match $guard
            .entry($key.to_string())
            .or_insert_with(|| Entry::$variant($default))
        {
            Entry::$variant(inner) => inner,
            _ => return Err(StoreError::WrongType($key.to_string())),
        }
    }};
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let guard = self.lock()?;
        Ok(guard.get(key).and_then(live_str).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut guard = self.lock()?;
        guard.insert(
            key.to_string(),
            Entry::Str {
                value: value.to_string(),
                expires: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut guard = self.lock()?;
        let current = match guard.get(key) {
            Some(entry) => match live_str(entry) {
                Some(value) => value
                    .parse::<i64>()
                    .map_err(|_| StoreError::WrongType(key.to_string()))?,
                None => 0,
            },
            None => 0,
        };
        let next = current + delta;
        guard.insert(
            key.to_string(),
            Entry::Str {
                value: next.to_string(),
                expires: None,
            },
        );
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut guard = self.lock()?;
        let set = typed_entry!(guard, key, Set, HashSet::new());
        Ok(set.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut guard = self.lock()?;
        match guard.get_mut(key) {
            Some(Entry::Set(set)) => Ok(set.remove(member)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let guard = self.lock()?;
        match guard.get(key) {
            Some(Entry::Set(set)) => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let guard = self.lock()?;
        match guard.get(key) {
            Some(Entry::Set(set)) => Ok(set.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn list_push_back(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut guard = self.lock()?;
        let list = typed_entry!(guard, key, List, VecDeque::new());
        if !list.iter().any(|m| m == member) {
            list.push_back(member.to_string());
        }
        Ok(())
    }

    async fn list_rotate(&self, key: &str) -> StoreResult<Option<String>> {
        let mut guard = self.lock()?;
        match guard.get_mut(key) {
            Some(Entry::List(list)) => {
                let Some(head) = list.pop_front() else {
                    return Ok(None);
                };
                list.push_back(head.clone());
                Ok(Some(head))
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn list_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut guard = self.lock()?;
        match guard.get_mut(key) {
            Some(Entry::List(list)) => {
                let before = list.len();
                list.retain(|m| m != member);
                Ok(list.len() != before)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(false),
        }
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let guard = self.lock()?;
        match guard.get(key) {
            Some(Entry::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn list_all(&self, key: &str) -> StoreResult<Vec<String>> {
        let guard = self.lock()?;
        match guard.get(key) {
            Some(Entry::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let guard = self.lock()?;
        match guard.get(key) {
            Some(Entry::Hash(map)) => Ok(map.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let guard = self.lock()?;
        match guard.get(key) {
            Some(Entry::Hash(map)) => Ok(map.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let mut guard = self.lock()?;
        let map = typed_entry!(guard, key, Hash, HashMap::new());
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut guard = self.lock()?;
        let map = typed_entry!(guard, key, Hash, HashMap::new());
        let current = map
            .get(field)
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| StoreError::WrongType(key.to_string()))
            })
            .transpose()?
            .unwrap_or(0);
        let next = current + delta;
        map.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut guard = self.lock()?;
        let zset = typed_entry!(guard, key, Zset, Vec::new());
        zset.retain(|(m, _)| m != member);
        zset.push((member.to_string(), score));
        zset.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(())
    }

    async fn zpop_min(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut guard = self.lock()?;
        match guard.get_mut(key) {
            Some(Entry::Zset(zset)) => {
                if zset.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(zset.remove(0)))
                }
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn zpop_max(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut guard = self.lock()?;
        match guard.get_mut(key) {
            Some(Entry::Zset(zset)) => Ok(zset.pop()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let guard = self.lock()?;
        match guard.get(key) {
            Some(Entry::Zset(zset)) => Ok(zset
                .iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .map(|(member, _)| member.clone())
                .collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut guard = self
            .subscribers
            .lock()
            .map_err(|_| StoreError::Other("memory store poisoned".to_string()))?;
        if let Some(senders) = guard.get_mut(channel) {
            senders.retain(|tx| tx.try_send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(64);
        let mut guard = self
            .subscribers
            .lock()
            .map_err(|_| StoreError::Other("memory store poisoned".to_string()))?;
        guard.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
