//! Execution contract between the conductor and whatever runs a job's flow.
//!
//! The conductor hands an [`Engine`] a [`WorkUnit`] and only looks at the
//! outcome's category to decide the job's [`Disposition`]:
//! - **Execution / Storage failures**: intrinsic to running the job, so the
//!   job is abandoned and retried later or elsewhere
//! - **Anything else, success included**: the job is consumed
//!
//! [`ProcessEngine`] runs flow steps as isolated child processes.

pub mod process;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use process::{ProcessEngine, StepResult};

use crate::board::Job;

/// Everything an execution needs, extracted from a claimed job.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub job: Job,
    pub flow_uuid: Uuid,
    pub store: Map<String, Value>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Execution failure: {0}")]
    Execution(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Task {task} failed: {reason}")]
    Task { task: String, reason: String },

    #[error("{} failures", .0.len())]
    Wrapped(Vec<EngineError>),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Failures that say nothing about the job itself being bad; the job
    /// should go back on the board.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Execution(_) | EngineError::Storage(_) => true,
            EngineError::Wrapped(failures) => {
                !failures.is_empty() && failures.iter().all(EngineError::is_retryable)
            }
            EngineError::Task { .. } | EngineError::Other(_) => false,
        }
    }
}

/// How a claimed job is released once its execution finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Consume,
    Abandon,
}

impl Disposition {
    pub fn for_outcome(outcome: &Result<(), EngineError>) -> Self {
        match outcome {
            Err(e) if e.is_retryable() => Disposition::Abandon,
            _ => Disposition::Consume,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Consume => write!(f, "consume"),
            Disposition::Abandon => write!(f, "abandon"),
        }
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn run(&self, unit: WorkUnit) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_failure() -> EngineError {
        EngineError::Task {
            task: "print".into(),
            reason: "Oeps!".into(),
        }
    }

    #[test]
    fn success_is_consumed() {
        assert_eq!(Disposition::for_outcome(&Ok(())), Disposition::Consume);
    }

    #[test]
    fn execution_and_storage_failures_are_abandoned() {
        let execution = Err(EngineError::Execution("engine died".into()));
        let storage = Err(EngineError::Storage("flow missing".into()));
        assert_eq!(Disposition::for_outcome(&execution), Disposition::Abandon);
        assert_eq!(Disposition::for_outcome(&storage), Disposition::Abandon);
    }

    #[test]
    fn task_and_other_failures_are_consumed() {
        assert_eq!(Disposition::for_outcome(&Err(task_failure())), Disposition::Consume);
        let other = Err(EngineError::Other("panicked".into()));
        assert_eq!(Disposition::for_outcome(&other), Disposition::Consume);
    }

    #[test]
    fn wrapped_failures_abandon_only_when_all_retryable() {
        let all_retryable = EngineError::Wrapped(vec![
            EngineError::Execution("a".into()),
            EngineError::Storage("b".into()),
        ]);
        let mixed = EngineError::Wrapped(vec![EngineError::Execution("a".into()), task_failure()]);

        assert!(all_retryable.is_retryable());
        assert!(!mixed.is_retryable());
        assert!(!EngineError::Wrapped(Vec::new()).is_retryable());
    }
}
