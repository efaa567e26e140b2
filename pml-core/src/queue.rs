//! Concurrent request queue: bounds the number of capability
//! invocations admitted at once so a burst of requests degrades with a
//! clear capacity error instead of unbounded memory growth or
//! unbounded backend fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, SemaphorePermit};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("request queue is at capacity ({capacity} in flight)")]
    AtCapacity { capacity: usize },
    #[error("request queue was closed while waiting for admission")]
    Closed,
}

impl From<AcquireError> for QueueError {
    fn from(_: AcquireError) -> Self {
        QueueError::Closed
    }
}

/// Admission strategy a [`RequestQueue`] is configured with, selected once
/// at construction rather than per call.
#[derive(Debug, Clone, Copy)]
pub enum QueueStrategy {
    /// Fail fast with [`QueueError::AtCapacity`] when no slot is free.
    Reject,
    /// Poll for a free slot every `sleep_ms`, retrying indefinitely.
    Sleep { sleep_ms: u64 },
    /// Wait on the semaphore's own FIFO queue with no bound.
    Queue,
}

/// Bounds in-flight capability executions to `capacity` concurrent slots,
/// admitting new requests according to the configured [`QueueStrategy`].
pub struct RequestQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    strategy: QueueStrategy,
}

pub struct Admission<'a> {
    _permit: SemaphorePermit<'a>,
}

impl RequestQueue {
    pub fn new(capacity: usize, strategy: QueueStrategy) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity, strategy }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Admit a request according to the queue's configured strategy.
    pub async fn admit(&self) -> Result<Admission<'_>, QueueError> {
        match self.strategy {
            QueueStrategy::Reject => self.try_admit(),
            QueueStrategy::Sleep { sleep_ms } => self.admit_by_polling(Duration::from_millis(sleep_ms)).await,
            QueueStrategy::Queue => self
                .semaphore
                .acquire()
                .await
                .map(|permit| Admission { _permit: permit })
                .map_err(QueueError::from),
        }
    }

    /// Try to admit a request without blocking; fails fast if the queue
    /// is already at capacity. Available regardless of the configured
    /// strategy as a fail-fast primitive.
    pub fn try_admit(&self) -> Result<Admission<'_>, QueueError> {
        self.semaphore
            .try_acquire()
            .map(|permit| Admission { _permit: permit })
            .map_err(|_| QueueError::AtCapacity { capacity: self.capacity })
    }

    /// Admit a request, waiting for a free slot up to `max_wait` before
    /// failing with [`QueueError::AtCapacity`].
    pub async fn admit_with_wait(&self, max_wait: Duration) -> Result<Admission<'_>, QueueError> {
        match tokio::time::timeout(max_wait, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(Admission { _permit: permit }),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::AtCapacity { capacity: self.capacity }),
        }
    }

    async fn admit_by_polling(&self, interval: Duration) -> Result<Admission<'_>, QueueError> {
        loop {
            match self.try_admit() {
                Ok(admission) => return Ok(admission),
                Err(QueueError::AtCapacity { .. }) => tokio::time::sleep(interval).await,
                Err(err) => return Err(err),
            }
        }
    }

    /// Owned-permit variant of [`Self::admit`], for callers (like the
    /// scheduler's per-level task spawns) that need the admission to
    /// outlive the borrow of `&self`, e.g. inside a `tokio::spawn`ed task.
    pub async fn admit_owned(&self) -> Result<OwnedAdmission, QueueError> {
        match self.strategy {
            QueueStrategy::Reject => self.try_admit_owned(),
            QueueStrategy::Sleep { sleep_ms } => self.admit_owned_by_polling(Duration::from_millis(sleep_ms)).await,
            QueueStrategy::Queue => self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map(|permit| OwnedAdmission { _permit: permit })
                .map_err(QueueError::from),
        }
    }

    fn try_admit_owned(&self) -> Result<OwnedAdmission, QueueError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(|permit| OwnedAdmission { _permit: permit })
            .map_err(|_| QueueError::AtCapacity { capacity: self.capacity })
    }

    async fn admit_owned_by_polling(&self, interval: Duration) -> Result<OwnedAdmission, QueueError> {
        loop {
            match self.try_admit_owned() {
                Ok(admission) => return Ok(admission),
                Err(QueueError::AtCapacity { .. }) => tokio::time::sleep(interval).await,
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct OwnedAdmission {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn try_admit_succeeds_while_under_capacity() {
        let queue = RequestQueue::new(2, QueueStrategy::Reject);
        let a = queue.try_admit().unwrap();
        let b = queue.try_admit().unwrap();
        assert_eq!(queue.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn try_admit_fails_fast_at_capacity() {
        let queue = RequestQueue::new(1, QueueStrategy::Reject);
        let _permit = queue.try_admit().unwrap();
        let result = queue.try_admit();
        assert!(matches!(result, Err(QueueError::AtCapacity { capacity: 1 })));
    }

    #[tokio::test]
    async fn admit_with_wait_unblocks_once_a_slot_frees() {
        let queue = Arc::new(RequestQueue::new(1, QueueStrategy::Queue));
        let permit = queue.try_admit().unwrap();

        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move {
            queue2.admit_with_wait(std::time::Duration::from_millis(500)).await.is_ok()
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(permit);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn admit_with_wait_times_out_under_sustained_pressure() {
        let queue = RequestQueue::new(1, QueueStrategy::Queue);
        let _permit = queue.try_admit().unwrap();
        let result = queue.admit_with_wait(std::time::Duration::from_millis(20)).await;
        assert!(matches!(result, Err(QueueError::AtCapacity { .. })));
    }

    #[tokio::test]
    async fn reject_strategy_admit_fails_immediately_at_capacity() {
        let queue = RequestQueue::new(1, QueueStrategy::Reject);
        let _permit = queue.try_admit().unwrap();
        let result = queue.admit().await;
        assert!(matches!(result, Err(QueueError::AtCapacity { .. })));
    }

    #[tokio::test]
    async fn sleep_strategy_polls_until_a_slot_frees() {
        let queue = Arc::new(RequestQueue::new(1, QueueStrategy::Sleep { sleep_ms: 5 }));
        let permit = queue.try_admit().unwrap();

        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move { queue2.admit().await.is_ok() });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        drop(permit);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn owned_admission_outlives_the_spawned_task_that_holds_it() {
        let queue = Arc::new(RequestQueue::new(1, QueueStrategy::Reject));
        let permit = queue.try_admit().unwrap();

        let queue2 = queue.clone();
        let handle = tokio::spawn(async move {
            // Would fail to compile with the borrowed `Admission` since
            // it can't outlive this spawned task's 'static bound.
            queue2.admit_owned().await
        });
        drop(permit);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn queue_strategy_admits_in_fifo_order_once_slots_free() {
        let queue = Arc::new(RequestQueue::new(1, QueueStrategy::Queue));
        let permit = queue.try_admit().unwrap();
        let result = queue.admit();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(permit);
        assert!(result.await.is_ok());
    }
}
