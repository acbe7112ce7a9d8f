//! Storage of flow details referenced by posted jobs.
//!
//! The board and conductor only pass a flow reference through; the engine
//! resolves it against a [`FlowStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Flow detail not found: {0}")]
    NotFound(Uuid),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStep {
    pub name: String,
    pub command: String,
}

/// A stored, ordered list of steps a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDetail {
    pub uuid: Uuid,
    pub name: String,
    pub steps: Vec<FlowStep>,
}

impl FlowDetail {
    pub fn new(name: &str) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, name: &str, command: &str) -> Self {
        self.steps.push(FlowStep {
            name: name.to_string(),
            command: command.to_string(),
        });
        self
    }
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn save(&self, flow: FlowDetail) -> Result<(), StorageError>;

    async fn load(&self, uuid: Uuid) -> Result<FlowDetail, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    flows: RwLock<HashMap<Uuid, FlowDetail>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.flows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.flows.read().await.is_empty()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn save(&self, flow: FlowDetail) -> Result<(), StorageError> {
        tracing::debug!(flow = %flow.uuid, name = %flow.name, "Saved flow detail");
        self.flows.write().await.insert(flow.uuid, flow);
        Ok(())
    }

    async fn load(&self, uuid: Uuid) -> Result<FlowDetail, StorageError> {
        self.flows
            .read()
            .await
            .get(&uuid)
            .cloned()
            .ok_or(StorageError::NotFound(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load() {
        let store = MemoryFlowStore::new();
        let flow = FlowDetail::new("testflow").with_step("first", "true");
        let uuid = flow.uuid;
        store.save(flow.clone()).await.unwrap();

        assert_eq!(store.load(uuid).await.unwrap(), flow);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn load_missing_flow() {
        let store = MemoryFlowStore::new();
        let uuid = Uuid::new_v4();
        assert_eq!(store.load(uuid).await, Err(StorageError::NotFound(uuid)));
    }
}
