//! Contract this crate needs from the hierarchical coordination service.
//!
//! The board only talks to the service through [`Coordinator`]:
//! - **Nodes**: persistent and ephemeral, optionally sequence-numbered
//! - **Transactions**: [`Coordinator::multi`] applies a batch of conditional
//!   operations atomically, which is how claim/consume/abandon avoid
//!   read-then-blind-write races
//! - **Watches**: [`Coordinator::watch_children`] streams children changes,
//!   re-arming after every delivery and across session loss
//!
//! [`memory`] provides an in-process implementation used by the server binary
//! and the test suite.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryCoordinator, MemoryNamespace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("No node at {0}")]
    NoNode(String),

    #[error("Node already exists at {0}")]
    NodeExists(String),

    #[error("Version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("Node at {0} still has children")]
    NotEmpty(String),

    #[error("Session {0} has expired")]
    SessionExpired(u64),

    #[error("Connection to the coordination service was lost")]
    ConnectionLoss,

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Session owning an ephemeral node, `None` for persistent ones.
    pub ephemeral_owner: Option<u64>,
    pub num_children: usize,
}

/// One step of an atomic [`Coordinator::multi`] transaction.
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: Option<i32>,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<i32>,
    },
    /// Fails the transaction unless the node exists (at `version`, if given).
    Check {
        path: String,
        version: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Current (sorted) children of the watched node.
    Children(Vec<String>),
    SessionLost,
    /// Always followed by a fresh [`WatchEvent::Children`] listing.
    SessionRestored,
}

/// Receiving side of a children watch. Ends when the watched node is deleted
/// or the coordinator goes away.
pub type ChildrenWatch = mpsc::UnboundedReceiver<WatchEvent>;

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Identifier of the session ephemeral nodes created through this handle
    /// belong to.
    fn session_id(&self) -> u64;

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    ) -> CoordinationResult<String>;

    /// Create every missing segment of `path` as an empty persistent node.
    async fn ensure_path(&self, path: &str) -> CoordinationResult<()>;

    async fn get(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)>;

    async fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>>;

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordinationResult<()>;

    async fn multi(&self, ops: Vec<Op>) -> CoordinationResult<()>;

    async fn watch_children(&self, path: &str) -> CoordinationResult<ChildrenWatch>;
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Split `path` into its parent and final segment.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, name))
}

pub(crate) fn validate_path(path: &str) -> CoordinationResult<()> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && !path.contains("//")
            && !path.contains('\0'));
    if valid {
        Ok(())
    } else {
        Err(CoordinationError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("/", "jobs"), "/jobs");
        assert_eq!(join_path("/jobs", "app1"), "/jobs/app1");
        assert_eq!(join_path("/jobs/", "app1"), "/jobs/app1");
    }

    #[test]
    fn split_path_returns_parent_and_name() {
        assert_eq!(split_path("/jobs/app1"), Some(("/jobs", "app1")));
        assert_eq!(split_path("/jobs"), Some(("/", "jobs")));
        assert_eq!(split_path("/"), None);
    }

    #[test]
    fn validate_path_rejects_malformed() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/a/b").is_ok());
        assert!(validate_path("a/b").is_err());
        assert!(validate_path("/a/").is_err());
        assert!(validate_path("/a//b").is_err());
    }
}
