use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use super::{ReplicaError, ReplicaStore};

struct Entry {
    value: String,
    expires_at: Instant,
}

// In-process replica used by engine and router tests. Supports the fault
// injection the quorum scenarios need: an unreachable switch and a fixed
// per-call latency, both honored under the paused tokio clock.
pub struct MemReplica {
    addr: String,
    entries: Mutex<HashMap<String, Entry>>,
    unreachable: AtomicBool,
    latency: StdMutex<Duration>,
}

impl MemReplica {
    pub fn new(addr: &str) -> MemReplica {
        MemReplica {
            addr: addr.to_owned(),
            entries: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            latency: StdMutex::new(Duration::ZERO),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    // Plants an entry as if another client had acquired it here.
    pub async fn seed(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().await.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn value_of(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        purge(&mut entries, key);
        entries.get(key).map(|e| e.value.clone())
    }

    async fn call(&self) -> Result<(), ReplicaError> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ReplicaError::Transport(format!(
                "{}: connection refused",
                self.addr
            )));
        }
        Ok(())
    }
}

fn purge(entries: &mut HashMap<String, Entry>, key: &str) {
    if let Some(entry) = entries.get(key) {
        if entry.expires_at <= Instant::now() {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl ReplicaStore for MemReplica {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        _deadline: Instant,
    ) -> Result<bool, ReplicaError> {
        self.call().await?;
        let mut entries = self.entries.lock().await;
        purge(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str, _deadline: Instant) -> Result<Option<String>, ReplicaError> {
        self.call().await?;
        let mut entries = self.entries.lock().await;
        purge(&mut entries, key);
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str, _deadline: Instant) -> Result<bool, ReplicaError> {
        self.call().await?;
        let mut entries = self.entries.lock().await;
        purge(&mut entries, key);
        Ok(entries.remove(key).is_some())
    }

    async fn set_expiry(
        &self,
        key: &str,
        ttl: Duration,
        _deadline: Instant,
    ) -> Result<bool, ReplicaError> {
        self.call().await?;
        let mut entries = self.entries.lock().await;
        purge(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remaining_ttl(
        &self,
        key: &str,
        _deadline: Instant,
    ) -> Result<Option<Duration>, ReplicaError> {
        self.call().await?;
        let mut entries = self.entries.lock().await;
        purge(&mut entries, key);
        Ok(entries
            .get(key)
            .map(|e| e.expires_at.saturating_duration_since(Instant::now())))
    }
}
