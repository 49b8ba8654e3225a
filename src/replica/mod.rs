#[cfg(test)]
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replica call timed out")]
    Timeout,

    #[error("replica transport error: {0}")]
    Transport(String),
}

// Result of a token-conditional delete on a single replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    // Key existed with the expected value and was removed.
    Deleted,
    // Key does not exist on this replica.
    Absent,
    // Key exists but is owned by a different value.
    Mismatch,
}

// One client per replica. Implementations connect to exactly one backing
// store; the coordinator holds the list. Every operation is bounded by the
// supplied deadline. "Key absent" is an Option/outcome, never an error;
// ReplicaError is reserved for transport-level failures.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    fn addr(&self) -> &str;

    // Atomically creates key=value with the given expiry, only if the key
    // is absent. Returns whether the entry was created.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<bool, ReplicaError>;

    async fn get(&self, key: &str, deadline: Instant) -> Result<Option<String>, ReplicaError>;

    // Returns whether the key existed.
    async fn delete(&self, key: &str, deadline: Instant) -> Result<bool, ReplicaError>;

    // Resets the expiry of an existing key. Returns false if the key is absent.
    async fn set_expiry(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<bool, ReplicaError>;

    // Remaining expiry of the key, or None if the key is absent.
    async fn remaining_ttl(
        &self,
        key: &str,
        deadline: Instant,
    ) -> Result<Option<Duration>, ReplicaError>;

    // Deletes the key only while it still carries `value`.
    //
    // The default body is read-then-delete and can race with expiry between
    // the two calls; backends with server-side scripting override it with a
    // single atomic operation.
    async fn delete_if_value(
        &self,
        key: &str,
        value: &str,
        deadline: Instant,
    ) -> Result<DeleteOutcome, ReplicaError> {
        match self.get(key, deadline).await? {
            None => Ok(DeleteOutcome::Absent),
            Some(v) if v == value => {
                self.delete(key, deadline).await?;
                Ok(DeleteOutcome::Deleted)
            }
            Some(_) => Ok(DeleteOutcome::Mismatch),
        }
    }

    // Extends the expiry of the key only while it still carries `value`.
    // Returns whether the expiry was reset. Same race caveat as
    // `delete_if_value` for the default body.
    async fn expire_if_value(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<bool, ReplicaError> {
        match self.get(key, deadline).await? {
            Some(v) if v == value => self.set_expiry(key, ttl, deadline).await,
            _ => Ok(false),
        }
    }

    // Remaining expiry of the key while it still carries `value`, or None
    // when the key is absent or owned by a different value.
    async fn ttl_if_value(
        &self,
        key: &str,
        value: &str,
        deadline: Instant,
    ) -> Result<Option<Duration>, ReplicaError> {
        match self.get(key, deadline).await? {
            Some(v) if v == value => self.remaining_ttl(key, deadline).await,
            _ => Ok(None),
        }
    }
}
