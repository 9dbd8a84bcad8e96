//! Weighted admission control for outstanding sub-range requests.
//!
//! Every request unit a worker sends costs one permit per sub-range it
//! carries. The limiter is shared by all workers of a job so the cluster-wide
//! number of ranges in flight stays bounded.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default cap on sub-ranges in flight across all nodes.
pub const DEFAULT_RANGE_LIMIT: u32 = 30_000_000;

/// Weighted semaphore shared by all per-node workers.
#[derive(Clone, Debug)]
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

/// Permits held for one request unit; released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    weight: u32,
}

impl AdmissionPermit {
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Release explicitly; same as dropping the permit.
    pub fn release(self) {}
}

impl AdmissionLimiter {
    /// Create a limiter admitting at most `capacity` sub-ranges at once.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait until `weight` permits are free and take them.
    ///
    /// The weight is clamped to `[1, capacity]` so a single oversized unit
    /// can still make progress on its own.
    pub async fn acquire(&self, weight: usize) -> anyhow::Result<AdmissionPermit> {
        let weight = u32::try_from(weight)
            .unwrap_or(u32::MAX)
            .clamp(1, self.capacity);
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(weight)
            .await
            .map_err(|_| anyhow::anyhow!("admission limiter closed"))?;
        Ok(AdmissionPermit {
            _permit: permit,
            weight,
        })
    }
}

impl Default for AdmissionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn permits_block_until_released() {
        let limiter = AdmissionLimiter::new(4);
        let first = limiter.acquire(3).await.unwrap();
        assert_eq!(limiter.available(), 1);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(2).await.map(|p| p.weight()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.release();
        let weight = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(weight, 2);
        assert_eq!(limiter.available(), 4);
    }

    #[tokio::test]
    async fn oversized_weight_is_clamped() {
        let limiter = AdmissionLimiter::new(2);
        let permit = limiter.acquire(100).await.unwrap();
        assert_eq!(permit.weight(), 2);
        assert_eq!(limiter.available(), 0);
        drop(permit);
        let permit = limiter.acquire(0).await.unwrap();
        assert_eq!(permit.weight(), 1);
    }
}
