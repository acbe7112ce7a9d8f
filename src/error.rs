use thiserror::Error;

use crate::coordination::CoordinationError;

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("Failed to post job {name}: {reason}")]
    PostingFailure { name: String, reason: String },

    #[error("Job {path} is already claimed by {owner}")]
    UnclaimableJob { path: String, owner: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} is not claimed by anyone")]
    NotClaimed(String),

    #[error("Job {path} is owned by {owner}, not {requester}")]
    NotOwner {
        path: String,
        owner: String,
        requester: String,
    },

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BoardError {
    /// Races another conductor can legitimately cause while we act on a job.
    pub fn is_expected_race(&self) -> bool {
        matches!(
            self,
            BoardError::UnclaimableJob { .. } | BoardError::JobNotFound(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Invalid timeout literal: {0}")]
    InvalidTimeout(String),

    #[error("Invalid worker pool size: {0}")]
    InvalidPoolSize(usize),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Worker pool is saturated ({0} executions in flight)")]
    PoolSaturated(usize),

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Job {0} carries no flow reference")]
    MissingFlowReference(String),

    #[error("Job {path} has an unusable store: {reason}")]
    InvalidStore { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, BoardError>;
