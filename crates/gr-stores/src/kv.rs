use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// KeyValueStore trait
// ---------------------------------------------------------------------------

/// The hot-tier contract: strings with TTL, atomic windowed counters,
/// hashes, capped lists, and time-scored sorted sets.
///
/// One implementation talks to Redis through a shared connection manager;
/// [`MemoryKv`] backs tests and degraded single-process operation. Every
/// operation runs under the client's per-operation deadline.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Pipelined INCR + EXPIRE. Returns the post-increment value. The two
    /// commands execute atomically so cross-process window counts are exact.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64>;

    // -- hashes --
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hlen(&self, key: &str) -> Result<usize>;

    // -- lists --
    /// LPUSH then LTRIM to `cap` entries.
    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn llen(&self, key: &str) -> Result<usize>;

    // -- sorted sets --
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize>;
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// RedisKv
// ---------------------------------------------------------------------------

/// Redis-backed [`KeyValueStore`]. The `ConnectionManager` multiplexes one
/// reconnecting connection; cloning is cheap, so a single instance serves
/// the whole process.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisKv {
    /// Connect to `url`. The manager establishes the connection lazily and
    /// transparently reconnects after drops.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(StoreError::from)?;
        debug!(url, "kv store connected");
        Ok(Self {
            manager,
            op_timeout,
        })
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, f(self.manager.clone())).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(format!("kv {op} deadline exceeded"))),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKv {
    async fn ping(&self) -> Result<()> {
        self.run("ping", |mut c| async move {
            redis::cmd("PING").query_async::<()>(&mut c).await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run("get", |mut c| async move { c.get(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        let secs = ttl.as_secs().max(1);
        self.run("set_ex", |mut c| async move {
            c.set_ex::<_, _, ()>(key, value, secs).await
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.run("del", |mut c| async move { c.del::<_, ()>(key).await })
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let secs = ttl.as_secs().max(1) as i64;
        self.run("expire", |mut c| async move {
            c.expire::<_, ()>(key, secs).await
        })
        .await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let key = key.to_string();
        let secs = ttl.as_secs().max(1) as i64;
        self.run("incr_with_expiry", |mut c| async move {
            let (count,): (i64,) = redis::pipe()
                .atomic()
                .incr(&key, 1)
                .expire(&key, secs)
                .ignore()
                .query_async(&mut c)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.run("hset", |mut c| async move {
            c.hset::<_, _, _, ()>(key, field, value).await
        })
        .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let (key, field) = (key.to_string(), field.to_string());
        self.run("hget", |mut c| async move { c.hget(key, field).await })
            .await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let key = key.to_string();
        let map: HashMap<String, String> = self
            .run("hgetall", |mut c| async move { c.hgetall(key).await })
            .await?;
        Ok(map.into_iter().collect())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let (key, field) = (key.to_string(), field.to_string());
        self.run("hdel", |mut c| async move {
            c.hdel::<_, _, ()>(key, field).await
        })
        .await
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let key = key.to_string();
        self.run("hlen", |mut c| async move { c.hlen(key).await }).await
    }

    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        let stop = cap.saturating_sub(1) as isize;
        self.run("lpush_capped", |mut c| async move {
            redis::pipe()
                .atomic()
                .lpush(&key, value)
                .ignore()
                .ltrim(&key, 0, stop)
                .ignore()
                .query_async::<()>(&mut c)
                .await
        })
        .await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let key = key.to_string();
        self.run("lrange", |mut c| async move {
            c.lrange(key, start, stop).await
        })
        .await
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let key = key.to_string();
        self.run("llen", |mut c| async move { c.llen(key).await }).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run("zadd", |mut c| async move {
            c.zadd::<_, _, _, ()>(key, member, score).await
        })
        .await
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let key = key.to_string();
        self.run("zrangebyscore", |mut c| async move {
            c.zrangebyscore(key, min, max).await
        })
        .await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        let key = key.to_string();
        self.run("zremrangebyscore", |mut c| async move {
            c.zrembyscore(key, min, max).await
        })
        .await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        let key = key.to_string();
        self.run("zcount", |mut c| async move { c.zcount(key, min, max).await })
            .await
    }
}

// ---------------------------------------------------------------------------
// MemoryKv
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Zset(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

/// In-process [`KeyValueStore`] with the same TTL semantics, used by tests
/// and as a degraded single-node fallback.
#[derive(Debug, Default)]
pub struct MemoryKv {
    slots: DashMap<String, Slot>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn live(&self, key: &str) -> Option<dashmap::mapref::one::RefMut<'_, String, Slot>> {
        if let Some(slot) = self.slots.get(key) {
            if let Some(at) = slot.expires_at {
                if Instant::now() >= at {
                    drop(slot);
                    self.slots.remove(key);
                    return None;
                }
            }
        }
        self.slots.get_mut(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live(key).as_deref() {
            Some(Slot {
                entry: Entry::Str(v),
                ..
            }) => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut slot) = self.live(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut slot = self.live(key).map(|s| s.clone()).unwrap_or(Slot {
            entry: Entry::Str("0".into()),
            expires_at: None,
        });
        let current = match &slot.entry {
            Entry::Str(v) => v.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        slot.entry = Entry::Str(next.to_string());
        slot.expires_at = Some(Instant::now() + ttl);
        self.slots.insert(key.to_string(), slot);
        Ok(next)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut slot = self.live(key).map(|s| s.clone()).unwrap_or(Slot {
            entry: Entry::Hash(HashMap::new()),
            expires_at: None,
        });
        if let Entry::Hash(map) = &mut slot.entry {
            map.insert(field.to_string(), value.to_string());
        } else {
            let mut map = HashMap::new();
            map.insert(field.to_string(), value.to_string());
            slot.entry = Entry::Hash(map);
        }
        self.slots.insert(key.to_string(), slot);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.live(key).as_deref() {
            Some(Slot {
                entry: Entry::Hash(map),
                ..
            }) => Ok(map.get(field).cloned()),
            _ => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        match self.live(key).as_deref() {
            Some(Slot {
                entry: Entry::Hash(map),
                ..
            }) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if let Some(mut slot) = self.live(key) {
            if let Entry::Hash(map) = &mut slot.entry {
                map.remove(field);
            }
        }
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        match self.live(key).as_deref() {
            Some(Slot {
                entry: Entry::Hash(map),
                ..
            }) => Ok(map.len()),
            _ => Ok(0),
        }
    }

    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut slot = self.live(key).map(|s| s.clone()).unwrap_or(Slot {
            entry: Entry::List(VecDeque::new()),
            expires_at: None,
        });
        if let Entry::List(list) = &mut slot.entry {
            list.push_front(value.to_string());
            list.truncate(cap);
        } else {
            let mut list = VecDeque::new();
            list.push_front(value.to_string());
            slot.entry = Entry::List(list);
        }
        self.slots.insert(key.to_string(), slot);
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        match self.live(key).as_deref() {
            Some(Slot {
                entry: Entry::List(list),
                ..
            }) => {
                let len = list.len() as isize;
                if len == 0 {
                    return Ok(Vec::new());
                }
                let norm = |i: isize| -> isize { if i < 0 { (len + i).max(0) } else { i } };
                let s = norm(start);
                let e = norm(stop).min(len - 1);
                if s > e || s >= len {
                    return Ok(Vec::new());
                }
                Ok(list
                    .iter()
                    .skip(s as usize)
                    .take((e - s + 1) as usize)
                    .cloned()
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        match self.live(key).as_deref() {
            Some(Slot {
                entry: Entry::List(list),
                ..
            }) => Ok(list.len()),
            _ => Ok(0),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut slot = self.live(key).map(|s| s.clone()).unwrap_or(Slot {
            entry: Entry::Zset(Vec::new()),
            expires_at: None,
        });
        if let Entry::Zset(set) = &mut slot.entry {
            set.retain(|(_, m)| m != member);
            set.push((score, member.to_string()));
            set.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            slot.entry = Entry::Zset(vec![(score, member.to_string())]);
        }
        self.slots.insert(key.to_string(), slot);
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        match self.live(key).as_deref() {
            Some(Slot {
                entry: Entry::Zset(set),
                ..
            }) => Ok(set
                .iter()
                .filter(|(s, _)| *s >= min && *s <= max)
                .map(|(_, m)| m.clone())
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        if let Some(mut slot) = self.live(key) {
            if let Entry::Zset(set) = &mut slot.entry {
                let before = set.len();
                set.retain(|(s, _)| *s < min || *s > max);
                return Ok(before - set.len());
            }
        }
        Ok(0)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        Ok(self.zrangebyscore(key, min, max).await?.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_set_get_del() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".into()));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_counts_every_call() {
        let kv = MemoryKv::new();
        for expected in 1..=5 {
            let n = kv
                .incr_with_expiry("w", Duration::from_secs(120))
                .await
                .unwrap();
            assert_eq!(n, expected);
        }
    }

    #[tokio::test]
    async fn hash_operations() {
        let kv = MemoryKv::new();
        kv.hset("h", "a", "1").await.unwrap();
        kv.hset("h", "b", "2").await.unwrap();
        assert_eq!(kv.hget("h", "a").await.unwrap(), Some("1".into()));
        assert_eq!(kv.hlen("h").await.unwrap(), 2);

        let mut all = kv.hgetall("h").await.unwrap();
        all.sort();
        assert_eq!(all, vec![("a".into(), "1".into()), ("b".into(), "2".into())]);

        kv.hdel("h", "a").await.unwrap();
        assert_eq!(kv.hget("h", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn capped_list_keeps_newest() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.lpush_capped("l", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(kv.llen("l").await.unwrap(), 3);
        let items = kv.lrange("l", 0, -1).await.unwrap();
        assert_eq!(items, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn zset_range_and_removal() {
        let kv = MemoryKv::new();
        kv.zadd("z", 1.0, "a").await.unwrap();
        kv.zadd("z", 2.0, "b").await.unwrap();
        kv.zadd("z", 3.0, "c").await.unwrap();

        assert_eq!(kv.zrangebyscore("z", 1.5, 3.5).await.unwrap(), vec!["b", "c"]);
        assert_eq!(kv.zcount("z", 0.0, 10.0).await.unwrap(), 3);

        let removed = kv.zremrangebyscore("z", 0.0, 2.0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.zcount("z", 0.0, 10.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zadd_replaces_member_score() {
        let kv = MemoryKv::new();
        kv.zadd("z", 1.0, "a").await.unwrap();
        kv.zadd("z", 5.0, "a").await.unwrap();
        assert_eq!(kv.zcount("z", 0.0, 10.0).await.unwrap(), 1);
        assert_eq!(kv.zrangebyscore("z", 4.0, 6.0).await.unwrap(), vec!["a"]);
    }
}
