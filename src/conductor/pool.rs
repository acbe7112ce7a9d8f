use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;

use crate::board::Job;
use crate::engine::{Engine, EngineError, WorkUnit};
use crate::error::{ConductorError, DispatchError};

/// Completion message for one execution, drained by the conductor.
#[derive(Debug)]
pub struct Resolution {
    pub job: Job,
    pub outcome: Result<(), EngineError>,
}

/// Bounded set of concurrently running executions.
///
/// Submission never blocks: a full pool rejects the unit. Each execution runs
/// in its own task, so a panicking engine is reported as a failure instead of
/// taking the conductor down with it.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_workers: usize,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Result<Self, ConductorError> {
        if max_workers == 0 {
            return Err(ConductorError::InvalidPoolSize(max_workers));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            tracker: TaskTracker::new(),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn in_flight(&self) -> usize {
        self.max_workers
            .saturating_sub(self.permits.available_permits())
    }

    pub fn has_capacity(&self) -> bool {
        !self.permits.is_closed() && self.permits.available_permits() > 0
    }

    pub fn submit(
        &self,
        engine: Arc<dyn Engine>,
        unit: WorkUnit,
        resolutions: mpsc::UnboundedSender<Resolution>,
    ) -> Result<(), DispatchError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => DispatchError::PoolClosed,
                TryAcquireError::NoPermits => DispatchError::PoolSaturated(self.in_flight()),
            })?;

        let job = unit.job.clone();
        self.tracker.spawn(async move {
            let outcome = match tokio::spawn(async move { engine.run(unit).await }).await {
                Ok(outcome) => outcome,
                Err(e) => Err(EngineError::Other(format!("execution aborted: {}", e))),
            };
            // The slot frees up before the conductor hears about the outcome.
            drop(permit);
            if resolutions.send(Resolution { job, outcome }).is_err() {
                tracing::warn!("Execution finished with no conductor left to resolve it");
            }
        });
        Ok(())
    }

    /// Reject further submissions.
    pub fn close(&self) {
        self.permits.close();
        self.tracker.close();
    }

    /// Close the pool and wait for every running execution to finish.
    pub async fn shutdown(&self) {
        self.close();
        self.tracker.wait().await;
    }
}
