use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::{Kv, KvOp, KvValue, Subscription};
use crate::KvError;

// Atomic: increment and set expiry only on first write. Mirrors the daily
// quota contract — a read-then-write sequence here would race across
// processes.
const LUA_INCR_EXPIRE: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

// ---------------------------------------------------------------------------
// RedisKv
// ---------------------------------------------------------------------------

/// Redis-backed [`Kv`] implementation.
///
/// Commands go through a multiplexed [`ConnectionManager`]; subscriptions
/// open a dedicated pub/sub connection each, torn down when the returned
/// [`Subscription`] is dropped.
pub struct RedisKv {
    client: redis::Client,
    conn: ConnectionManager,
    incr_script: Script,
}

impl RedisKv {
    /// Connect to the store at `url` (e.g. `redis://localhost:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)
            .map_err(|e| KvError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(url, "connected to kv store");
        Ok(Self {
            client,
            conn,
            incr_script: Script::new(LUA_INCR_EXPIRE),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn incr_with_ttl(&self, key: &str, ttl_seconds: u64) -> Result<i64, KvError> {
        let mut conn = self.conn();
        let value: i64 = self
            .incr_script
            .key(key)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e: redis::RedisError| {
                if e.kind() == redis::ErrorKind::NoScriptError {
                    KvError::Script(e.to_string())
                } else {
                    KvError::from(e)
                }
            })?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ex: Option<u64>) -> Result<(), KvError> {
        let mut conn = self.conn();
        match ex {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), KvError> {
        let mut conn = self.conn();
        conn.expire::<_, ()>(key, ttl_seconds as i64).await?;
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hincrbyfloat(&self, key: &str, field: &str, delta: f64) -> Result<f64, KvError> {
        let mut conn = self.conn();
        let value: f64 = redis::cmd("HINCRBYFLOAT")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        Ok(conn.hset_nx(key, field, value).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        Ok(conn.sismember(key, member).await?)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, KvError> {
        let mut conn = self.conn();
        let receivers: u64 = conn.publish(channel, payload).await?;
        debug!(channel, receivers, "published message");
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, KvError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(KvError::from)?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        info!(channels = ?channels, "subscribed to kv channels");

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel, error = %e, "dropping undecodable pubsub payload");
                        continue;
                    }
                };
                if tx.send((channel, payload)).await.is_err() {
                    // Subscriber dropped; tear down the listener.
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<Vec<KvValue>, KvError> {
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                KvOp::HincrBy { key, field, delta } => {
                    pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta);
                }
                KvOp::HincrByFloat { key, field, delta } => {
                    pipe.cmd("HINCRBYFLOAT").arg(key).arg(field).arg(*delta);
                }
                KvOp::Hset { key, field, value } => {
                    pipe.cmd("HSET").arg(key).arg(field).arg(value);
                }
                KvOp::Hsetnx { key, field, value } => {
                    pipe.cmd("HSETNX").arg(key).arg(field).arg(value);
                }
                KvOp::Hget { key, field } => {
                    pipe.cmd("HGET").arg(key).arg(field);
                }
                KvOp::Sadd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member);
                }
                KvOp::Srem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member);
                }
                KvOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key);
                }
            }
        }

        let mut conn = self.conn();
        let raw: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        Ok(raw.into_iter().map(convert_value).collect())
    }

    async fn reconnect(&self) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

fn convert_value(value: redis::Value) -> KvValue {
    match value {
        redis::Value::Nil => KvValue::Nil,
        redis::Value::Int(i) => KvValue::Int(i),
        redis::Value::BulkString(bytes) => {
            KvValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        redis::Value::SimpleString(s) => KvValue::Text(s),
        redis::Value::Okay => KvValue::Text("OK".into()),
        redis::Value::Double(d) => KvValue::Text(d.to_string()),
        other => KvValue::Text(format!("{other:?}")),
    }
}
