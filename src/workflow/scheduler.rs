// ResourceScheduler - per-stage token pools shared by every concurrent run
//
// One fair (FIFO) semaphore per stage type. A StageToken returns its permit on
// drop, so success, failure, timeout and cancellation all release identically.
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::SchedulerError;
use crate::types::StageId;

/// Pool size per stage type, sized to the scarcest resource behind it
#[derive(Debug, Clone)]
pub struct PoolSizes {
    pub text: usize,
    pub speech: usize,
    pub render: usize,
    pub transcribe: usize,
    pub sync: usize,
    pub music: usize,
    pub assembly: usize,
    pub publish: usize,
}

impl PoolSizes {
    pub fn capacity(&self, stage: StageId) -> usize {
        match stage {
            StageId::TextGeneration => self.text,
            StageId::SpeechSynthesis => self.speech,
            StageId::VideoGeneration => self.render,
            StageId::Transcription => self.transcribe,
            StageId::SyncPlan => self.sync,
            StageId::MusicMix => self.music,
            StageId::Assembly => self.assembly,
            StageId::Publish => self.publish,
        }
    }

    /// Same capacity everywhere except the render queue
    pub fn uniform(capacity: usize, render: usize) -> Self {
        Self {
            text: capacity,
            speech: capacity,
            render,
            transcribe: capacity,
            sync: capacity,
            music: capacity,
            assembly: capacity,
            publish: capacity,
        }
    }
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            text: 2,
            speech: 4,
            render: 1,
            transcribe: 1,
            sync: 8,
            music: 4,
            assembly: 2,
            publish: 1,
        }
    }
}

struct Pool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    holders: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Admission ticket for one stage invocation
pub struct StageToken {
    stage: StageId,
    acquired_at: Instant,
    holders: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl StageToken {
    pub fn stage(&self) -> StageId {
        self.stage
    }
}

impl Drop for StageToken {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub stage: StageId,
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    /// Highest number of simultaneous holders observed
    pub peak: usize,
}

pub struct ResourceScheduler {
    pools: HashMap<StageId, Pool>,
}

impl ResourceScheduler {
    pub fn new(sizes: &PoolSizes) -> Self {
        let pools = StageId::PIPELINE
            .iter()
            .map(|stage| {
                let capacity = sizes.capacity(*stage).max(1);
                let pool = Pool {
                    capacity,
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    holders: Arc::new(AtomicUsize::new(0)),
                    peak: Arc::new(AtomicUsize::new(0)),
                };
                (*stage, pool)
            })
            .collect();
        Self { pools }
    }

    /// Wait (FIFO) for a token of `stage` until `deadline`
    pub async fn acquire(&self, stage: StageId, deadline: Instant) -> Result<StageToken, SchedulerError> {
        let pool = self.pools.get(&stage).ok_or(SchedulerError::UnknownStage(stage))?;
        let started = Instant::now();

        let permit = match tokio::time::timeout_at(deadline, pool.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SchedulerError::Closed(stage)),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(stage = %stage, waited_ms, "token acquire timed out");
                return Err(SchedulerError::TimeoutExceeded { stage, waited_ms });
            }
        };

        let holders = pool.holders.fetch_add(1, Ordering::SeqCst) + 1;
        pool.peak.fetch_max(holders, Ordering::SeqCst);
        tracing::debug!(
            stage = %stage,
            holders,
            capacity = pool.capacity,
            waited_ms = started.elapsed().as_millis() as u64,
            "token acquired"
        );

        Ok(StageToken {
            stage,
            acquired_at: Instant::now(),
            holders: pool.holders.clone(),
            _permit: permit,
        })
    }

    /// Return a token to its pool (dropping it has the same effect)
    pub fn release(&self, token: StageToken) {
        tracing::debug!(
            stage = %token.stage,
            held_ms = token.acquired_at.elapsed().as_millis() as u64,
            "token released"
        );
        drop(token);
    }

    pub fn available(&self, stage: StageId) -> usize {
        self.pools
            .get(&stage)
            .map(|p| p.semaphore.available_permits())
            .unwrap_or(0)
    }

    pub fn capacity(&self, stage: StageId) -> usize {
        self.pools.get(&stage).map(|p| p.capacity).unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        StageId::PIPELINE
            .iter()
            .filter_map(|stage| {
                self.pools.get(stage).map(|pool| PoolStats {
                    stage: *stage,
                    capacity: pool.capacity,
                    available: pool.semaphore.available_permits(),
                    in_use: pool.holders.load(Ordering::SeqCst),
                    peak: pool.peak.load(Ordering::SeqCst),
                })
            })
            .collect()
    }

    /// True when every pool has all of its tokens back
    pub fn is_idle(&self) -> bool {
        self.pools
            .values()
            .all(|p| p.semaphore.available_permits() == p.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_capacity_under_load() {
        let scheduler = Arc::new(ResourceScheduler::new(&PoolSizes::uniform(3, 1)));
        let mut handles = Vec::new();

        for _ in 0..12 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let token = scheduler.acquire(StageId::SpeechSynthesis, far_deadline()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                scheduler.release(token);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = scheduler.stats();
        let speech = stats.iter().find(|s| s.stage == StageId::SpeechSynthesis).unwrap();
        assert!(speech.peak <= 3, "peak {} exceeded capacity", speech.peak);
        assert_eq!(speech.available, 3);
        assert_eq!(speech.in_use, 0);
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_pool_is_held() {
        let scheduler = ResourceScheduler::new(&PoolSizes::uniform(2, 1));
        let held = scheduler.acquire(StageId::VideoGeneration, far_deadline()).await.unwrap();

        let result = scheduler
            .acquire(StageId::VideoGeneration, Instant::now() + Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(SchedulerError::TimeoutExceeded { stage: StageId::VideoGeneration, .. })));

        // A timed-out waiter leaves no trace in the pool
        drop(held);
        assert_eq!(scheduler.available(StageId::VideoGeneration), 1);
        assert!(scheduler.acquire(StageId::VideoGeneration, far_deadline()).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let scheduler = Arc::new(ResourceScheduler::new(&PoolSizes::uniform(1, 1)));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let first = scheduler.acquire(StageId::VideoGeneration, far_deadline()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let scheduler = scheduler.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let token = scheduler.acquire(StageId::VideoGeneration, far_deadline()).await.unwrap();
                order.lock().await.push(i);
                drop(token);
            }));
            // Let each waiter enqueue before the next one
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_raised_to_one() {
        let scheduler = ResourceScheduler::new(&PoolSizes::uniform(0, 0));
        assert_eq!(scheduler.capacity(StageId::VideoGeneration), 1);
        assert_eq!(scheduler.capacity(StageId::Publish), 1);
    }
}
