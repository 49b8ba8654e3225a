use std::cmp;
use std::fmt;
use std::sync::Arc;

use log::trace;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{BackoffConfig, ClientError, Coordinator, LockHandle};
use crate::utils::{jitter, rng_seed_now};

// Client-side lock manager. Wraps a coordinator transport with the
// retry/backoff loop and hands out scoped guards.
pub struct LockClient<C: Coordinator> {
    coordinator: Arc<C>,
    backoff: BackoffConfig,
}

impl<C: Coordinator> LockClient<C> {
    pub fn new(coordinator: C) -> LockClient<C> {
        LockClient::with_backoff(coordinator, BackoffConfig::default())
    }

    pub fn with_backoff(coordinator: C, backoff: BackoffConfig) -> LockClient<C> {
        LockClient {
            coordinator: Arc::new(coordinator),
            backoff,
        }
    }

    // Acquires `resource` for `ttl`, retrying conflicts with jittered
    // exponential backoff until `wait_budget` elapses. Conflicts past the
    // budget surface as `Timeout`; every other coordinator error aborts
    // the loop immediately.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        wait_budget: Duration,
    ) -> Result<LockGuard<C>, ClientError> {
        self.acquire_cancellable(resource, ttl, wait_budget, &CancellationToken::new())
            .await
    }

    // Same as `acquire`, returning `Cancelled` as soon as `cancel` fires.
    // No release is issued on cancellation: there is no handle yet.
    pub async fn acquire_cancellable(
        &self,
        resource: &str,
        ttl: Duration,
        wait_budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockGuard<C>, ClientError> {
        let deadline = Instant::now() + wait_budget;
        let mut backoff = self.backoff.initial;
        let mut rng = rng_seed_now();

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            match self.coordinator.acquire(resource, ttl).await {
                Ok(token) => {
                    return Ok(LockGuard {
                        coordinator: self.coordinator.clone(),
                        handle: LockHandle {
                            resource: resource.to_owned(),
                            token,
                            acquired_at: Instant::now(),
                        },
                        released: false,
                    });
                }
                Err(ClientError::Conflict(message)) => {
                    if Instant::now() >= deadline {
                        trace!(
                            "sdk: giving up on '{}' after the wait budget: {}",
                            resource,
                            message
                        );
                        return Err(ClientError::Timeout);
                    }
                    let delay = backoff + jitter(&mut rng, self.backoff.max_jitter);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    backoff = cmp::min(backoff * 2, self.backoff.max_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// Scoped ownership of an acquired lock. Dropping the guard without an
// explicit `release` issues a best-effort background release, so the lock
// is let go on every exit path, unwinding included.
pub struct LockGuard<C: Coordinator> {
    coordinator: Arc<C>,
    handle: LockHandle,
    released: bool,
}

impl<C: Coordinator> fmt::Debug for LockGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

impl<C: Coordinator> LockGuard<C> {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub fn token(&self) -> &str {
        &self.handle.token
    }

    // Single request, no retry loop. `NotFound` means the protected
    // section must be treated as lost.
    pub async fn refresh(&self, new_ttl: Duration) -> Result<(), ClientError> {
        self.coordinator
            .refresh(&self.handle.resource, &self.handle.token, new_ttl)
            .await
    }

    pub async fn remaining_ttl(&self) -> Result<Duration, ClientError> {
        self.coordinator
            .remaining_ttl(&self.handle.resource, &self.handle.token)
            .await
    }

    // Releases the lock. A lock that is already gone counts as released;
    // network failures surface in the return value, never as a panic.
    pub async fn release(mut self) -> Result<(), ClientError> {
        let result = self
            .coordinator
            .release(&self.handle.resource, &self.handle.token)
            .await;
        // The drop fallback stays armed until the call has resolved, so a
        // release future dropped mid-flight still gets a background retry.
        self.released = true;
        match result {
            Ok(()) | Err(ClientError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl<C: Coordinator> Drop for LockGuard<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let coordinator = self.coordinator.clone();
        let handle = self.handle.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(err) = coordinator.release(&handle.resource, &handle.token).await {
                    trace!(
                        "sdk: background release of '{}' failed: {}",
                        handle.resource,
                        err
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct ScriptedCoordinator {
        // Outcomes popped per acquire attempt; empty means conflict.
        acquire_results: Mutex<VecDeque<Result<String, ClientError>>>,
        attempts: AtomicUsize,
        released: Mutex<Vec<(String, String)>>,
        release_not_found: bool,
        // Injected network latency for release calls.
        release_delay: Duration,
    }

    impl ScriptedCoordinator {
        fn scripted(results: Vec<Result<String, ClientError>>) -> ScriptedCoordinator {
            ScriptedCoordinator {
                acquire_results: Mutex::new(results.into()),
                ..Default::default()
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Coordinator for ScriptedCoordinator {
        async fn acquire(&self, _resource: &str, _ttl: Duration) -> Result<String, ClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.acquire_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::Conflict("held elsewhere".to_owned())))
        }

        async fn release(&self, resource: &str, token: &str) -> Result<(), ClientError> {
            if !self.release_delay.is_zero() {
                tokio::time::sleep(self.release_delay).await;
            }
            self.released
                .lock()
                .unwrap()
                .push((resource.to_owned(), token.to_owned()));
            if self.release_not_found {
                return Err(ClientError::NotFound);
            }
            Ok(())
        }

        async fn refresh(
            &self,
            _resource: &str,
            _token: &str,
            _new_ttl: Duration,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn remaining_ttl(&self, _resource: &str, _token: &str) -> Result<Duration, ClientError> {
            Ok(Duration::from_secs(1))
        }
    }

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            max_jitter: Duration::ZERO,
            ..BackoffConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_until_budget_exhausted() {
        let client = LockClient::with_backoff(ScriptedCoordinator::default(), no_jitter());

        // Attempts land at 0ms, 100ms and 300ms; the budget runs out
        // before the next 400ms of backoff elapse.
        let err = client
            .acquire("orders-42", Duration::from_millis(50), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(client.coordinator.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds_after_conflicts() {
        let client = LockClient::with_backoff(
            ScriptedCoordinator::scripted(vec![
                Err(ClientError::Conflict("held".to_owned())),
                Err(ClientError::Conflict("held".to_owned())),
                Ok("token-3".to_owned()),
            ]),
            no_jitter(),
        );

        let guard = client
            .acquire("orders-42", Duration::from_secs(1), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(guard.token(), "token-3");
        assert_eq!(guard.handle().resource, "orders-42");
        assert_eq!(client.coordinator.attempts(), 3);
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_fatal_error_aborts_loop() {
        let client = LockClient::with_backoff(
            ScriptedCoordinator::scripted(vec![Err(ClientError::Server("boom".to_owned()))]),
            no_jitter(),
        );

        let err = client
            .acquire("orders-42", Duration::from_secs(1), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
        assert_eq!(client.coordinator.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancelled_mid_backoff() {
        let client = LockClient::with_backoff(ScriptedCoordinator::default(), no_jitter());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client
            .acquire_cancellable(
                "orders-42",
                Duration::from_secs(1),
                Duration::from_secs(60),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        // One attempt went out before the token fired mid-sleep.
        assert_eq!(client.coordinator.attempts(), 1);
    }

    #[tokio::test]
    async fn test_release_maps_not_found_to_ok() {
        let coordinator = ScriptedCoordinator {
            acquire_results: Mutex::new(vec![Ok("token-1".to_owned())].into()),
            release_not_found: true,
            ..Default::default()
        };
        let client = LockClient::with_backoff(coordinator, no_jitter());

        let guard = client
            .acquire("orders-42", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        guard.release().await.unwrap();
        assert_eq!(
            client.coordinator.released.lock().unwrap().as_slice(),
            &[("orders-42".to_owned(), "token-1".to_owned())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_dropped_mid_flight_still_releases() {
        let coordinator = ScriptedCoordinator {
            acquire_results: Mutex::new(vec![Ok("token-1".to_owned())].into()),
            release_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let client = LockClient::with_backoff(coordinator, no_jitter());

        let guard = client
            .acquire("orders-42", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        // Abandon the slow release; dropping the guard mid-flight must
        // fall back to the background release.
        let abandoned = tokio::time::timeout(Duration::from_secs(1), guard.release()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(client.coordinator.released.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_releases_in_background() {
        let client = LockClient::with_backoff(
            ScriptedCoordinator::scripted(vec![Ok("token-1".to_owned())]),
            no_jitter(),
        );

        {
            let _guard = client
                .acquire("orders-42", Duration::from_secs(1), Duration::from_secs(1))
                .await
                .unwrap();
        }
        // Let the spawned release run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.coordinator.released.lock().unwrap().len(), 1);
    }
}
