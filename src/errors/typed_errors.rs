use thiserror::Error;

// Single per-request outcome surfaced by the coordinator. Per-replica
// failures never appear here; they are tallied and logged inside the
// quorum engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    // Inputs malformed or missing.
    #[error("bad request: {0}")]
    BadRequest(String),

    // Quorum not reached during acquire.
    #[error("could not acquire lock: {0}")]
    Conflict(String),

    // Lock absent, expired or held under another token.
    #[error("lock not found")]
    NotFound,

    // Replica errors outside the quorum-pass path.
    #[error("internal error: {0}")]
    Internal(String),
}
