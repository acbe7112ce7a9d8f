//! Claim, dispatch and resolve loop.
//!
//! Each pass of [`Conductor::run`]:
//!
//! 1. Walks the board's multi-queue iterator (unclaimed heads only)
//! 2. Claims each candidate; lost races are skipped silently
//! 3. Submits the claimed job to the [`WorkerPool`] without waiting for it
//! 4. Pauses on the [`WaitTimer`], waking early when an execution finishes
//!
//! Executions report back over a channel only this loop drains, so every
//! consume/abandon is issued from the conductor task itself.

pub mod pool;
pub mod timer;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

pub use pool::{Resolution, WorkerPool};
pub use timer::WaitTimer;

use crate::board::job::STORE_KEY;
use crate::board::{Board, IterStep, Job};
use crate::config::ConductorConfig;
use crate::engine::{Disposition, Engine, EngineError, WorkUnit};
use crate::error::{ConductorError, DispatchError};

/// Raises the dead signal when the loop exits, however it exits.
struct DeadSignal<'a>(&'a watch::Sender<bool>);

impl Drop for DeadSignal<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

pub struct Conductor {
    name: String,
    board: Arc<dyn Board>,
    engine: Arc<dyn Engine>,
    pool: WorkerPool,
    timer: WaitTimer,
    dead: watch::Sender<bool>,
}

impl Conductor {
    pub fn new(
        board: Arc<dyn Board>,
        engine: Arc<dyn Engine>,
        pool: WorkerPool,
        config: &ConductorConfig,
    ) -> Result<Self, ConductorError> {
        let timeout = config.wait_timeout.resolve()?;
        let (dead, _) = watch::channel(false);
        Ok(Self {
            name: config.name.clone(),
            board,
            engine,
            pool,
            timer: WaitTimer::new(timeout),
            dead,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_timeout(&self) -> Duration {
        self.timer.timeout()
    }

    /// Request the loop to stop claiming. Returns immediately.
    pub fn stop(&self) {
        self.timer.interrupt();
    }

    /// False once a stop was requested or the loop has exited.
    pub fn dispatching(&self) -> bool {
        !self.timer.is_stopped() && !*self.dead.borrow()
    }

    /// Executions currently running on the pool.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn max_workers(&self) -> usize {
        self.pool.max_workers()
    }

    /// Wait for the loop to exit. Returns false if `timeout` elapsed first.
    ///
    /// After [`stop`](Self::stop) the loop only exits once every execution
    /// already dispatched has been resolved, so a false return can just mean
    /// a job is still running.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut dead = self.dead.subscribe();
        let exited = dead.wait_for(|dead| *dead);
        match timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, exited).await, Ok(Ok(_))),
            None => exited.await.is_ok(),
        }
    }

    pub async fn run(&self) {
        self.dead.send_replace(false);
        let _dead = DeadSignal(&self.dead);
        let (resolutions_tx, mut resolutions) = mpsc::unbounded_channel();
        let mut pending = 0usize;

        tracing::info!(conductor = %self.name, board = %self.board.name(), "Conductor started");

        loop {
            if self.timer.is_stopped() {
                break;
            }
            pending += self.dispatch_pass(&resolutions_tx).await;

            while let Ok(resolution) = resolutions.try_recv() {
                pending -= 1;
                self.resolve(resolution).await;
            }

            if self.timer.is_stopped() {
                break;
            }
            tokio::select! {
                _ = self.timer.wait() => {}
                Some(resolution) = resolutions.recv(), if pending > 0 => {
                    pending -= 1;
                    self.resolve(resolution).await;
                }
            }
        }

        if pending > 0 {
            tracing::info!(
                conductor = %self.name,
                pending,
                "Stopping, waiting for in-flight executions"
            );
        }
        while pending > 0 {
            match resolutions.recv().await {
                Some(resolution) => {
                    pending -= 1;
                    self.resolve(resolution).await;
                }
                None => break,
            }
        }

        tracing::info!(conductor = %self.name, "Conductor stopped");
    }

    /// One walk over the board. Returns the number of executions dispatched.
    async fn dispatch_pass(&self, resolutions: &mpsc::UnboundedSender<Resolution>) -> usize {
        let mut dispatched = 0;
        let mut jobs = self.board.iterjobs(true, false);

        loop {
            if self.timer.is_stopped() {
                break;
            }
            if !self.pool.has_capacity() {
                tracing::debug!(
                    conductor = %self.name,
                    in_flight = self.pool.in_flight(),
                    "Worker pool full, ending pass"
                );
                break;
            }

            let job = match jobs.next().await {
                Ok(IterStep::HasNext(job)) => job,
                Ok(IterStep::Exhausted) => break,
                Err(e) => {
                    tracing::warn!(conductor = %self.name, error = %e, "Failed to iterate jobs");
                    break;
                }
            };

            tracing::debug!(job = %job.path(), "Trying to claim job");
            match self.board.claim(&job, &self.name).await {
                Ok(()) => {}
                Err(e) if e.is_expected_race() => {
                    tracing::debug!(job = %job.path(), "Job already claimed or consumed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job = %job.path(), error = %e, "Failed to claim job");
                    continue;
                }
            }

            let path = job.path().to_string();
            match self.dispatch(job, resolutions) {
                Ok(()) => {
                    tracing::info!(job = %path, conductor = %self.name, "Dispatched job");
                    dispatched += 1;
                }
                Err(e) => {
                    tracing::warn!(job = %path, error = %e, "Job dispatching failed");
                }
            }
        }
        dispatched
    }

    fn dispatch(
        &self,
        job: Job,
        resolutions: &mpsc::UnboundedSender<Resolution>,
    ) -> Result<(), DispatchError> {
        let flow_uuid = job
            .flow_uuid()
            .ok_or_else(|| DispatchError::MissingFlowReference(job.path().to_string()))?;
        let store = match job.details().get(STORE_KEY) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(store)) => store.clone(),
            Some(other) => {
                return Err(DispatchError::InvalidStore {
                    path: job.path().to_string(),
                    reason: format!("expected an object, found {}", other),
                })
            }
        };

        let unit = WorkUnit {
            job,
            flow_uuid,
            store,
        };
        self.pool
            .submit(Arc::clone(&self.engine), unit, resolutions.clone())
    }

    async fn resolve(&self, resolution: Resolution) {
        let Resolution { job, outcome } = resolution;
        let disposition = Disposition::for_outcome(&outcome);

        match &outcome {
            Ok(()) => tracing::info!(job = %job.path(), "Job completed successfully"),
            Err(e) => {
                tracing::warn!(
                    job = %job.path(),
                    error = %e,
                    disposition = %disposition,
                    "Job execution failed"
                );
                if let EngineError::Wrapped(failures) = e {
                    for (i, failure) in failures.iter().enumerate() {
                        tracing::warn!(job = %job.path(), "{}. {}", i + 1, failure);
                    }
                }
            }
        }

        let result = match disposition {
            Disposition::Consume => self.board.consume(&job, &self.name).await,
            Disposition::Abandon => self.board.abandon(&job, &self.name).await,
        };
        if let Err(e) = result {
            tracing::warn!(
                job = %job.path(),
                error = %e,
                disposition = %disposition,
                "Failed job resolution"
            );
        }
    }
}
