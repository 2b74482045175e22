use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::store::{Kv, KvOp, KvValue, Subscription};
use crate::KvError;

// ---------------------------------------------------------------------------
// MemoryKv
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-process [`Kv`] implementation for tests and single-node development.
///
/// Counters are serialized by the interior mutex, matching the strict
/// ordering the real store provides. Expiry is evaluated lazily on access.
#[derive(Default)]
pub struct MemoryKv {
    strings: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().expect("channels lock poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn incr_with_ttl(&self, key: &str, ttl_seconds: u64) -> Result<i64, KvError> {
        let mut strings = self.strings.lock().expect("strings lock poisoned");
        let entry = strings.get(key).filter(|e| e.live()).cloned();
        let next = match entry {
            Some(e) => {
                let current: i64 = e
                    .value
                    .parse()
                    .map_err(|_| KvError::Protocol(format!("non-integer value at {key}")))?;
                strings.insert(
                    key.to_string(),
                    Entry {
                        value: (current + 1).to_string(),
                        expires_at: e.expires_at,
                    },
                );
                current + 1
            }
            None => {
                strings.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
                    },
                );
                1
            }
        };
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let strings = self.strings.lock().expect("strings lock poisoned");
        Ok(strings
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ex: Option<u64>) -> Result<(), KvError> {
        let mut strings = self.strings.lock().expect("strings lock poisoned");
        strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ex.map(|secs| Instant::now() + Duration::from_secs(secs)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.strings.lock().expect("strings lock poisoned").remove(key);
        self.hashes.lock().expect("hashes lock poisoned").remove(key);
        self.sets.lock().expect("sets lock poisoned").remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), KvError> {
        let mut strings = self.strings.lock().expect("strings lock poisoned");
        if let Some(entry) = strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds));
        }
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        let mut hashes = self.hashes.lock().expect("hashes lock poisoned");
        let hash = hashes.entry(key.to_string()).or_default();
        let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hincrbyfloat(&self, key: &str, field: &str, delta: f64) -> Result<f64, KvError> {
        let mut hashes = self.hashes.lock().expect("hashes lock poisoned");
        let hash = hashes.entry(key.to_string()).or_default();
        let current: f64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut hashes = self.hashes.lock().expect("hashes lock poisoned");
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, KvError> {
        let mut hashes = self.hashes.lock().expect("hashes lock poisoned");
        let hash = hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            Ok(false)
        } else {
            hash.insert(field.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let hashes = self.hashes.lock().expect("hashes lock poisoned");
        Ok(hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let hashes = self.hashes.lock().expect("hashes lock poisoned");
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut sets = self.sets.lock().expect("sets lock poisoned");
        sets.entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let sets = self.sets.lock().expect("sets lock poisoned");
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let sets = self.sets.lock().expect("sets lock poisoned");
        Ok(sets.get(key).map(|s| s.contains(member)).unwrap_or(false))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut sets = self.sets.lock().expect("sets lock poisoned");
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, KvError> {
        let sender = self.sender_for(channel);
        Ok(sender.send(payload.to_string()).map(|n| n as u64).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, KvError> {
        let (tx, rx) = mpsc::channel(256);
        for channel in channels {
            let mut broadcast_rx = self.sender_for(channel).subscribe();
            let channel = channel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Ok(payload) = broadcast_rx.recv().await {
                    if tx.send((channel.clone(), payload)).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(Subscription::new(rx))
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<Vec<KvValue>, KvError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let value = match op {
                KvOp::HincrBy { key, field, delta } => {
                    KvValue::Int(self.hincrby(&key, &field, delta).await?)
                }
                KvOp::HincrByFloat { key, field, delta } => {
                    KvValue::Text(self.hincrbyfloat(&key, &field, delta).await?.to_string())
                }
                KvOp::Hset { key, field, value } => {
                    self.hset(&key, &field, &value).await?;
                    KvValue::Int(1)
                }
                KvOp::Hsetnx { key, field, value } => {
                    KvValue::Int(self.hsetnx(&key, &field, &value).await? as i64)
                }
                KvOp::Hget { key, field } => match self.hget(&key, &field).await? {
                    Some(v) => KvValue::Text(v),
                    None => KvValue::Nil,
                },
                KvOp::Sadd { key, member } => {
                    self.sadd(&key, &member).await?;
                    KvValue::Int(1)
                }
                KvOp::Srem { key, member } => {
                    self.srem(&key, &member).await?;
                    KvValue::Int(1)
                }
                KvOp::Delete { key } => {
                    self.delete(&key).await?;
                    KvValue::Int(1)
                }
            };
            results.push(value);
        }
        Ok(results)
    }

    async fn reconnect(&self) -> Result<(), KvError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_with_ttl_counts_up() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_with_ttl("c", 60).await.unwrap(), 1);
        assert_eq!(kv.incr_with_ttl("c", 60).await.unwrap(), 2);
        assert_eq!(kv.incr_with_ttl("c", 60).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn incr_with_ttl_expires_and_restarts() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_with_ttl("c", 1).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(kv.incr_with_ttl("c", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_with_expiry_goes_away() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(1)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_ops() {
        let kv = MemoryKv::new();
        assert_eq!(kv.hincrby("h", "count", 1).await.unwrap(), 1);
        assert_eq!(kv.hincrby("h", "count", 2).await.unwrap(), 3);
        let total = kv.hincrbyfloat("h", "latency", 1.5).await.unwrap();
        assert!((total - 1.5).abs() < f64::EPSILON);
        assert!(kv.hsetnx("h", "first", "a").await.unwrap());
        assert!(!kv.hsetnx("h", "first", "b").await.unwrap());
        assert_eq!(kv.hget("h", "first").await.unwrap().as_deref(), Some("a"));
        let all = kv.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn set_ops() {
        let kv = MemoryKv::new();
        kv.sadd("s", "a").await.unwrap();
        kv.sadd("s", "a").await.unwrap();
        kv.sadd("s", "b").await.unwrap();
        assert!(kv.sismember("s", "a").await.unwrap());
        assert_eq!(kv.smembers("s").await.unwrap().len(), 2);
        kv.srem("s", "a").await.unwrap();
        assert!(!kv.sismember("s", "a").await.unwrap());
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let kv = MemoryKv::new();
        let mut sub = kv.subscribe(&["events".to_string()]).await.unwrap();
        kv.publish("events", "hello").await.unwrap();
        let (channel, payload) = sub.recv().await.unwrap();
        assert_eq!(channel, "events");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn pipeline_preserves_order() {
        let kv = MemoryKv::new();
        let results = kv
            .pipeline(vec![
                KvOp::HincrBy {
                    key: "h".into(),
                    field: "n".into(),
                    delta: 5,
                },
                KvOp::Hget {
                    key: "h".into(),
                    field: "n".into(),
                },
                KvOp::Hget {
                    key: "h".into(),
                    field: "missing".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(results[0], KvValue::Int(5));
        assert_eq!(results[1].as_str(), Some("5"));
        assert_eq!(results[2], KvValue::Nil);
    }

    #[tokio::test]
    async fn concurrent_incr_is_strictly_serialized() {
        use std::sync::Arc;
        let kv = Arc::new(MemoryKv::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.incr_with_ttl("race", 60).await.unwrap()
            }));
        }
        let mut seen: Vec<i64> = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }
}
