mod coordinator;

pub use coordinator::*;
use tokio::time::Duration;

// Smallest TTL a client may request.
pub const MIN_TTL: Duration = Duration::from_millis(1);

// A granted lock. The token is the bearer proof of ownership for
// release, refresh and ttl.
#[derive(Debug, Clone)]
pub struct AcquiredLock {
    pub resource: String,
    pub token: String,
    pub ttl: Duration,
}

// Minimum agreement required to grant a lock.
pub fn quorum(replicas: usize) -> usize {
    replicas / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(5), 3);
        assert_eq!(quorum(7), 4);
    }
}
