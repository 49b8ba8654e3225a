use std::cmp;
use std::sync::Arc;

use anyhow::ensure;
use futures_util::future::join_all;
use log::trace;
use tokio::sync::mpsc::channel;
use tokio::time::{timeout_at, Duration, Instant};
use uuid::Uuid;

use super::{quorum, AcquiredLock, MIN_TTL};
use crate::config::Config;
use crate::errors::LockError;
use crate::replica::{DeleteOutcome, ReplicaStore};

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    // Upper bound for requested TTLs.
    pub max_ttl: Duration,
    // Timeout for a single replica call; clamped to whatever remains of
    // the request deadline.
    pub replica_timeout: Duration,
    // Overall deadline for one coordinator request.
    pub request_deadline: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> CoordinatorOptions {
        CoordinatorOptions {
            max_ttl: Duration::from_secs(600),
            replica_timeout: Duration::from_secs(2),
            request_deadline: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for CoordinatorOptions {
    fn from(config: &Config) -> CoordinatorOptions {
        CoordinatorOptions {
            max_ttl: config.max_ttl,
            replica_timeout: config.replica_timeout,
            request_deadline: config.request_deadline,
        }
    }
}

// The quorum engine. Stateless across requests: it owns the replica list
// and nothing else, so any coordinator process can serve any request.
pub struct LockCoordinator<S: ReplicaStore + 'static> {
    replicas: Vec<Arc<S>>,
    quorum: usize,
    options: CoordinatorOptions,
}

struct Grant {
    index: usize,
    granted: bool,
}

#[derive(Default)]
struct ReleaseTally {
    released: usize,
    // Entry absent or carrying a different token; either way this client
    // no longer owns anything on that replica.
    missing: usize,
    errors: usize,
}

impl<S: ReplicaStore + 'static> LockCoordinator<S> {
    pub fn new(
        replicas: Vec<Arc<S>>,
        options: CoordinatorOptions,
    ) -> anyhow::Result<LockCoordinator<S>> {
        ensure!(
            replicas.len() >= 3,
            "at least 3 replicas are required, got {}",
            replicas.len()
        );
        ensure!(
            replicas.len() % 2 == 1,
            "replica count must be odd, got {}",
            replicas.len()
        );
        let quorum = quorum(replicas.len());
        Ok(LockCoordinator {
            replicas,
            quorum,
            options,
        })
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    // Acquires `resource` for `ttl`, minting a fresh token. The lock is
    // granted only when a quorum of replicas accepted the entry and the
    // whole fan-out finished within the ttl; otherwise whatever subset was
    // written is reclaimed best-effort and the call reports a conflict.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<AcquiredLock, LockError> {
        validate_resource(resource)?;
        self.validate_ttl(ttl)?;

        let token = Uuid::new_v4().to_string();
        if self.lock_all(resource, &token, ttl).await {
            Ok(AcquiredLock {
                resource: resource.to_owned(),
                token,
                ttl,
            })
        } else {
            Err(LockError::Conflict("lock quorum not reached".to_owned()))
        }
    }

    // Releases `resource` on every replica still carrying `token`.
    pub async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        validate_resource(resource)?;
        validate_token(token)?;

        let tally = self.release_fanout(resource, token).await;
        if tally.missing >= self.quorum {
            return Err(LockError::NotFound);
        }
        if tally.released >= self.quorum {
            return Ok(());
        }
        Err(LockError::Internal(format!(
            "released on {} of {} replicas ({} errors)",
            tally.released,
            self.replicas.len(),
            tally.errors
        )))
    }

    // Extends the lock to `new_ttl` on every replica still carrying
    // `token`. Partial successes are left in place; a later refresh or
    // release reconciles them.
    pub async fn refresh(
        &self,
        resource: &str,
        token: &str,
        new_ttl: Duration,
    ) -> Result<(), LockError> {
        validate_resource(resource)?;
        validate_token(token)?;
        self.validate_ttl(new_ttl)?;

        let overall = Instant::now() + self.options.request_deadline;
        let started = Instant::now();
        let refreshed = join_all(self.replicas.iter().map(|replica| {
            let replica = replica.clone();
            let resource = resource.to_owned();
            let token = token.to_owned();
            let deadline = self.call_deadline(overall);
            async move {
                match timeout_at(
                    deadline,
                    replica.expire_if_value(&resource, &token, new_ttl, deadline),
                )
                .await
                {
                    Ok(Ok(refreshed)) => refreshed,
                    Ok(Err(err)) => {
                        trace!(
                            "dlock: refresh of '{}' failed at {}: {}",
                            resource,
                            replica.addr(),
                            err
                        );
                        false
                    }
                    Err(_) => {
                        trace!(
                            "dlock: refresh of '{}' timed out at {}",
                            resource,
                            replica.addr()
                        );
                        false
                    }
                }
            }
        }))
        .await
        .into_iter()
        .filter(|refreshed| *refreshed)
        .count();

        // A refresh that outlived the extension it granted leaves the
        // caller holding time it does not have; report the lock as lost,
        // same as acquire does for its ttl.
        if refreshed >= self.quorum && started.elapsed() < new_ttl {
            Ok(())
        } else {
            Err(LockError::NotFound)
        }
    }

    // Average remaining TTL across the replicas still carrying `token`.
    pub async fn remaining_ttl(&self, resource: &str, token: &str) -> Result<Duration, LockError> {
        validate_resource(resource)?;
        validate_token(token)?;

        let overall = Instant::now() + self.options.request_deadline;
        let ttls: Vec<Duration> = join_all(self.replicas.iter().map(|replica| {
            let replica = replica.clone();
            let resource = resource.to_owned();
            let token = token.to_owned();
            let deadline = self.call_deadline(overall);
            async move {
                match timeout_at(deadline, replica.ttl_if_value(&resource, &token, deadline)).await
                {
                    Ok(Ok(ttl)) => ttl,
                    Ok(Err(err)) => {
                        trace!(
                            "dlock: ttl of '{}' failed at {}: {}",
                            resource,
                            replica.addr(),
                            err
                        );
                        None
                    }
                    Err(_) => {
                        trace!("dlock: ttl of '{}' timed out at {}", resource, replica.addr());
                        None
                    }
                }
            }
        }))
        .await
        .into_iter()
        .flatten()
        .filter(|ttl| !ttl.is_zero())
        .collect();

        if ttls.len() < self.quorum {
            return Err(LockError::NotFound);
        }
        let sum: Duration = ttls.iter().sum();
        Ok(sum / ttls.len() as u32)
    }

    async fn lock_all(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let overall = Instant::now() + self.options.request_deadline;
        let started = Instant::now();

        let (tx, mut rx) = channel(self.replicas.len());
        let mut handles = Vec::with_capacity(self.replicas.len());
        for (index, replica) in self.replicas.iter().enumerate() {
            let replica = replica.clone();
            let tx = tx.clone();
            let resource = resource.to_owned();
            let token = token.to_owned();
            let deadline = self.call_deadline(overall);
            handles.push(tokio::spawn(async move {
                let granted = match timeout_at(
                    deadline,
                    replica.set_if_absent(&resource, &token, ttl, deadline),
                )
                .await
                {
                    Ok(Ok(granted)) => granted,
                    Ok(Err(err)) => {
                        trace!(
                            "dlock: set-if-absent of '{}' failed at {}: {}",
                            resource,
                            replica.addr(),
                            err
                        );
                        false
                    }
                    Err(_) => {
                        trace!(
                            "dlock: set-if-absent of '{}' timed out at {}",
                            resource,
                            replica.addr()
                        );
                        false
                    }
                };
                let _ = tx.send(Grant { index, granted }).await;
            }));
        }
        drop(tx);

        // Wait until every reply arrived or enough non-grants came in for
        // the quorum to be impossible.
        let tolerance = self.replicas.len() - self.quorum;
        let mut granted = 0;
        let mut failed = 0;
        while let Some(grant) = rx.recv().await {
            if grant.granted {
                granted += 1;
            } else {
                failed += 1;
                if failed > tolerance {
                    break;
                }
            }
        }

        let elapsed = started.elapsed();
        let locked = granted >= self.quorum && elapsed < ttl;
        if !locked {
            if granted >= self.quorum {
                trace!(
                    "dlock: acquisition of '{}' took {:?}, past its {:?} ttl",
                    resource,
                    elapsed,
                    ttl
                );
            }
            // Reclaim whatever subset was written, counted replies and
            // in-flight ones alike.
            self.release_fanout(resource, token).await;
        }

        // Replies past the early exit may still have granted; clear those
        // entries once their calls finish.
        let replicas = self.replicas.clone();
        let replica_timeout = self.options.replica_timeout;
        let resource = resource.to_owned();
        let token = token.to_owned();
        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            rx.close();
            while let Some(grant) = rx.recv().await {
                if locked || !grant.granted {
                    continue;
                }
                let replica = &replicas[grant.index];
                let deadline = Instant::now() + replica_timeout;
                trace!(
                    "dlock: releasing late grant of '{}' at {}",
                    resource,
                    replica.addr()
                );
                if let Err(err) = replica.delete_if_value(&resource, &token, deadline).await {
                    trace!(
                        "dlock: late release of '{}' failed at {}: {}",
                        resource,
                        replica.addr(),
                        err
                    );
                }
            }
        });

        locked
    }

    async fn release_fanout(&self, resource: &str, token: &str) -> ReleaseTally {
        let overall = Instant::now() + self.options.request_deadline;
        let outcomes = join_all(self.replicas.iter().map(|replica| {
            let replica = replica.clone();
            let resource = resource.to_owned();
            let token = token.to_owned();
            let deadline = self.call_deadline(overall);
            async move {
                match timeout_at(deadline, replica.delete_if_value(&resource, &token, deadline))
                    .await
                {
                    Ok(Ok(outcome)) => Some(outcome),
                    Ok(Err(err)) => {
                        trace!(
                            "dlock: release of '{}' failed at {}: {}",
                            resource,
                            replica.addr(),
                            err
                        );
                        None
                    }
                    Err(_) => {
                        trace!(
                            "dlock: release of '{}' timed out at {}",
                            resource,
                            replica.addr()
                        );
                        None
                    }
                }
            }
        }))
        .await;

        let mut tally = ReleaseTally::default();
        for outcome in outcomes {
            match outcome {
                Some(DeleteOutcome::Deleted) => tally.released += 1,
                Some(DeleteOutcome::Absent) | Some(DeleteOutcome::Mismatch) => tally.missing += 1,
                None => tally.errors += 1,
            }
        }
        tally
    }

    fn call_deadline(&self, overall: Instant) -> Instant {
        cmp::min(Instant::now() + self.options.replica_timeout, overall)
    }

    fn validate_ttl(&self, ttl: Duration) -> Result<(), LockError> {
        if ttl < MIN_TTL || ttl > self.options.max_ttl {
            return Err(LockError::BadRequest(format!(
                "ttl must be between {} and {}",
                humantime::format_duration(MIN_TTL),
                humantime::format_duration(self.options.max_ttl)
            )));
        }
        Ok(())
    }
}

fn validate_resource(resource: &str) -> Result<(), LockError> {
    if resource.is_empty() {
        return Err(LockError::BadRequest("resource must not be empty".to_owned()));
    }
    Ok(())
}

fn validate_token(token: &str) -> Result<(), LockError> {
    if token.is_empty() {
        return Err(LockError::BadRequest("token must not be empty".to_owned()));
    }
    Ok(())
}
