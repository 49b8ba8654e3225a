mod client;
mod http;

use async_trait::async_trait;
pub use client::*;
pub use http::*;
use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("bad request: {0}")]
    BadRequest(String),

    // Another holder owns the resource; retryable within the wait budget.
    #[error("lock is held elsewhere: {0}")]
    Conflict(String),

    #[error("lock not found")]
    NotFound,

    // Wait budget exhausted without the lock being granted.
    #[error("timed out waiting for lock")]
    Timeout,

    #[error("acquisition cancelled")]
    Cancelled,

    #[error("coordinator error: {0}")]
    Server(String),

    #[error("transport error: {0}")]
    Transport(String),
}

// Wire-level view of the coordinator. The HTTP implementation lives in
// `HttpCoordinator`; tests substitute scripted ones.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    // Returns the minted token on success.
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<String, ClientError>;
    async fn release(&self, resource: &str, token: &str) -> Result<(), ClientError>;
    async fn refresh(
        &self,
        resource: &str,
        token: &str,
        new_ttl: Duration,
    ) -> Result<(), ClientError>;
    async fn remaining_ttl(&self, resource: &str, token: &str) -> Result<Duration, ClientError>;
}

// Retry pacing for acquire. Each round sleeps backoff plus a uniformly
// random jitter, then doubles the backoff up to the cap.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_jitter: Duration::from_millis(500),
        }
    }
}

// Proof of ownership held by the client between acquire and release.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub resource: String,
    pub token: String,
    pub acquired_at: Instant,
}
