use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script, Value};
use tokio::sync::Mutex;
use tokio::time::{error::Elapsed, timeout_at, Duration, Instant};

use super::{DeleteOutcome, ReplicaError, ReplicaStore};

// Conditional scripts keyed on value equality, so that delete/expire/ttl
// observe and act on the entry in a single server-side step.
const DELETE_IF_VALUE_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if current == false then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call("DEL", KEYS[1])
return 1
"#;

const EXPIRE_IF_VALUE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

const TTL_IF_VALUE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PTTL", KEYS[1])
else
  return -2
end
"#;

lazy_static! {
    static ref DELETE_IF_VALUE: Script = Script::new(DELETE_IF_VALUE_SCRIPT);
    static ref EXPIRE_IF_VALUE: Script = Script::new(EXPIRE_IF_VALUE_SCRIPT);
    static ref TTL_IF_VALUE: Script = Script::new(TTL_IF_VALUE_SCRIPT);
}

// Client for a single Redis replica. The multiplexed connection is created
// lazily, shared across requests and dropped on the first transport error so
// the next call reconnects.
pub struct RedisReplica {
    addr: String,
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisReplica {
    pub fn new(addr: &str) -> anyhow::Result<RedisReplica> {
        let client = Client::open(format!("redis://{}", addr))?;
        Ok(RedisReplica {
            addr: addr.to_owned(),
            client,
            conn: Mutex::new(None),
        })
    }

    async fn conn(&self, deadline: Instant) -> Result<MultiplexedConnection, ReplicaError> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = timeout_at(deadline, self.client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| ReplicaError::Timeout)?
            .map_err(|err| ReplicaError::Transport(err.to_string()))?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    async fn finish<T>(&self, res: Result<redis::RedisResult<T>, Elapsed>) -> Result<T, ReplicaError> {
        match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(err)) => {
                self.reset().await;
                Err(ReplicaError::Transport(err.to_string()))
            }
            Err(_) => Err(ReplicaError::Timeout),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl ReplicaStore for RedisReplica {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<bool, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        let reply: Value = self
            .finish(
                timeout_at(
                    deadline,
                    redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_millis(ttl))
                        .query_async(&mut conn),
                )
                .await,
            )
            .await?;
        Ok(matches!(reply, Value::Okay))
    }

    async fn get(&self, key: &str, deadline: Instant) -> Result<Option<String>, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        self.finish(timeout_at(deadline, redis::cmd("GET").arg(key).query_async(&mut conn)).await)
            .await
    }

    async fn delete(&self, key: &str, deadline: Instant) -> Result<bool, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        let removed: i64 = self
            .finish(timeout_at(deadline, redis::cmd("DEL").arg(key).query_async(&mut conn)).await)
            .await?;
        Ok(removed > 0)
    }

    async fn set_expiry(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<bool, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        let reset: i64 = self
            .finish(
                timeout_at(
                    deadline,
                    redis::cmd("PEXPIRE")
                        .arg(key)
                        .arg(ttl_millis(ttl))
                        .query_async(&mut conn),
                )
                .await,
            )
            .await?;
        Ok(reset == 1)
    }

    async fn remaining_ttl(
        &self,
        key: &str,
        deadline: Instant,
    ) -> Result<Option<Duration>, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        let millis: i64 = self
            .finish(timeout_at(deadline, redis::cmd("PTTL").arg(key).query_async(&mut conn)).await)
            .await?;
        if millis < 0 {
            // -2 absent; -1 exists without expiry, which is not an entry of ours.
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn delete_if_value(
        &self,
        key: &str,
        value: &str,
        deadline: Instant,
    ) -> Result<DeleteOutcome, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        let outcome: i64 = self
            .finish(
                timeout_at(
                    deadline,
                    DELETE_IF_VALUE.key(key).arg(value).invoke_async(&mut conn),
                )
                .await,
            )
            .await?;
        Ok(match outcome {
            1 => DeleteOutcome::Deleted,
            -1 => DeleteOutcome::Absent,
            _ => DeleteOutcome::Mismatch,
        })
    }

    async fn expire_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<bool, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        let reset: i64 = self
            .finish(
                timeout_at(
                    deadline,
                    EXPIRE_IF_VALUE
                        .key(key)
                        .arg(value)
                        .arg(ttl_millis(ttl))
                        .invoke_async(&mut conn),
                )
                .await,
            )
            .await?;
        Ok(reset == 1)
    }

    async fn ttl_if_value(
        &self,
        key: &str,
        value: &str,
        deadline: Instant,
    ) -> Result<Option<Duration>, ReplicaError> {
        let mut conn = self.conn(deadline).await?;
        let millis: i64 = self
            .finish(
                timeout_at(
                    deadline,
                    TTL_IF_VALUE.key(key).arg(value).invoke_async(&mut conn),
                )
                .await,
            )
            .await?;
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }
}
