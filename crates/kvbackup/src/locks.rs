//! Batched lock resolution between rounds.
//!
//! Lock conflicts reported during a round are collected and resolved with a
//! single resolver call once the round's streams have drained. The outcome is
//! threaded into the next round's request so nodes can read past resolved
//! locks. Failures are logged and deferred: the affected ranges stay
//! incomplete and report their locks again next round.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cluster::{LockResolver, ResolvedLocks};
use crate::types::{BackupRequest, LockInfo};

/// First backoff sleep after a failed resolve attempt.
const LOCK_RESOLVE_BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Longest single backoff sleep.
const LOCK_RESOLVE_BACKOFF_MAX: Duration = Duration::from_secs(3);

/// Result of resolving one round's locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRoundOutcome {
    /// No locks were reported this round.
    Idle,
    /// Locks were resolved and merged into the request.
    Resolved { ignored: usize, committed: usize },
    /// Resolution failed or was cancelled; locks will be retried next round.
    Deferred,
}

/// Collects lock conflicts for one round and resolves them in a batch.
pub struct LockResolutionBatcher {
    resolver: Arc<dyn LockResolver>,
    pending: Vec<LockInfo>,
    max_backoff: Duration,
}

impl LockResolutionBatcher {
    /// `max_backoff` bounds the total time spent sleeping between attempts.
    pub fn new(resolver: Arc<dyn LockResolver>, max_backoff: Duration) -> Self {
        Self {
            resolver,
            pending: Vec::new(),
            max_backoff,
        }
    }

    pub fn push(&mut self, lock: LockInfo) {
        self.pending.push(lock);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop collected locks without resolving them (round torn down).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Resolve every collected lock and fold the outcome into `request`.
    ///
    /// Never fails: errors are logged and the locks are dropped so they can
    /// be reported afresh by the next round.
    pub async fn resolve_round(
        &mut self,
        snapshot_ts: u64,
        request: &mut BackupRequest,
        cancel: &CancellationToken,
    ) -> LockRoundOutcome {
        if self.pending.is_empty() {
            return LockRoundOutcome::Idle;
        }
        let locks = std::mem::take(&mut self.pending);
        tracing::info!(locks = locks.len(), snapshot_ts, "resolving locks for backup");

        match self.resolve_with_backoff(snapshot_ts, &locks, cancel).await {
            Ok(resolved) => {
                let ignored = resolved.ignored.len();
                let committed = resolved.committed.len();
                merge_versions(&mut request.resolved_locks, resolved.ignored);
                merge_versions(&mut request.committed_locks, resolved.committed);
                tracing::info!(
                    locks = locks.len(),
                    ignored,
                    committed,
                    "backup lock resolution finished"
                );
                LockRoundOutcome::Resolved { ignored, committed }
            }
            Err(err) => {
                tracing::warn!(
                    locks = locks.len(),
                    error = ?err,
                    "backup lock resolution failed, retrying next round"
                );
                LockRoundOutcome::Deferred
            }
        }
    }

    async fn resolve_with_backoff(
        &self,
        snapshot_ts: u64,
        locks: &[LockInfo],
        cancel: &CancellationToken,
    ) -> anyhow::Result<ResolvedLocks> {
        let mut slept = Duration::ZERO;
        let mut attempt = 0u32;
        loop {
            let err = match self.resolver.resolve_locks_for_read(snapshot_ts, locks).await {
                Ok(resolved) => return Ok(resolved),
                Err(err) => err,
            };
            attempt += 1;
            let remaining = self.max_backoff.saturating_sub(slept);
            if remaining.is_zero() {
                return Err(err.context(format!(
                    "lock resolution backoff exhausted after {attempt} attempts"
                )));
            }
            let delay = lock_backoff(attempt).min(remaining);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = ?err, "lock resolution attempt failed");
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(err.context("lock resolution cancelled"));
                }
                () = tokio::time::sleep(delay) => {}
            }
            slept += delay;
        }
    }
}

/// Exponential backoff for the `attempt`-th retry.
fn lock_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(8);
    LOCK_RESOLVE_BACKOFF_BASE
        .saturating_mul(1u32 << shift)
        .min(LOCK_RESOLVE_BACKOFF_MAX)
}

/// Append versions not already present.
fn merge_versions(into: &mut Vec<u64>, versions: Vec<u64>) {
    for version in versions {
        if !into.contains(&version) {
            into.push(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockResolver {
        calls: Mutex<Vec<Vec<u64>>>,
        failures_left: Mutex<u32>,
    }

    impl MockResolver {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures_left: Mutex::new(failures),
            })
        }
    }

    #[async_trait]
    impl LockResolver for MockResolver {
        async fn resolve_locks_for_read(
            &self,
            _snapshot_ts: u64,
            locks: &[LockInfo],
        ) -> anyhow::Result<ResolvedLocks> {
            self.calls
                .lock()
                .unwrap()
                .push(locks.iter().map(|l| l.lock_version).collect());
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("resolver unavailable");
            }
            Ok(ResolvedLocks {
                ignored: locks
                    .iter()
                    .filter(|l| l.lock_version % 2 == 1)
                    .map(|l| l.lock_version)
                    .collect(),
                committed: locks
                    .iter()
                    .filter(|l| l.lock_version % 2 == 0)
                    .map(|l| l.lock_version)
                    .collect(),
            })
        }
    }

    fn lock(version: u64) -> LockInfo {
        LockInfo {
            key: format!("k{version}").into_bytes(),
            primary_lock: b"p".to_vec(),
            lock_version: version,
            lock_ttl: 3000,
            txn_size: 1,
        }
    }

    #[tokio::test]
    async fn locks_are_resolved_in_one_batch() {
        let resolver = MockResolver::new(0);
        let mut batcher = LockResolutionBatcher::new(resolver.clone(), Duration::from_secs(1));
        batcher.push(lock(11));
        batcher.push(lock(20));
        let mut request = BackupRequest {
            resolved_locks: vec![11],
            ..BackupRequest::default()
        };

        let outcome = batcher
            .resolve_round(100, &mut request, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            LockRoundOutcome::Resolved {
                ignored: 1,
                committed: 1
            }
        );
        assert_eq!(resolver.calls.lock().unwrap().clone(), vec![vec![11, 20]]);
        assert_eq!(request.resolved_locks, vec![11]);
        assert_eq!(request.committed_locks, vec![20]);
        assert!(batcher.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_skips_resolver() {
        let resolver = MockResolver::new(0);
        let mut batcher = LockResolutionBatcher::new(resolver.clone(), Duration::from_secs(1));
        let mut request = BackupRequest::default();
        let outcome = batcher
            .resolve_round(100, &mut request, &CancellationToken::new())
            .await;
        assert_eq!(outcome, LockRoundOutcome::Idle);
        assert!(resolver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_within_budget() {
        let resolver = MockResolver::new(2);
        let mut batcher = LockResolutionBatcher::new(resolver.clone(), Duration::from_secs(10));
        batcher.push(lock(5));
        let mut request = BackupRequest::default();
        let outcome = batcher
            .resolve_round(100, &mut request, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, LockRoundOutcome::Resolved { .. }));
        assert_eq!(resolver.calls.lock().unwrap().len(), 3);
        assert_eq!(request.resolved_locks, vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_defers_without_failing() {
        let resolver = MockResolver::new(u32::MAX);
        let mut batcher =
            LockResolutionBatcher::new(resolver.clone(), Duration::from_millis(250));
        batcher.push(lock(5));
        let mut request = BackupRequest::default();
        let outcome = batcher
            .resolve_round(100, &mut request, &CancellationToken::new())
            .await;
        assert_eq!(outcome, LockRoundOutcome::Deferred);
        assert!(request.resolved_locks.is_empty());
        // 100ms + 150ms (clamped) then the budget is spent.
        assert_eq!(resolver.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(lock_backoff(1), Duration::from_millis(100));
        assert_eq!(lock_backoff(2), Duration::from_millis(200));
        assert_eq!(lock_backoff(6), Duration::from_secs(3));
        assert_eq!(lock_backoff(50), Duration::from_secs(3));
    }
}
