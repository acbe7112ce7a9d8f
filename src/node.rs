use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::board::{Board, FlatBoard, PerQueueBoard};
use crate::conductor::{Conductor, WorkerPool};
use crate::config::{BoardKind, NodeConfig};
use crate::coordination::{Coordinator, MemoryNamespace};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::engine::ProcessEngine;
use crate::error::ConductorError;
use crate::persistence::{FlowStore, MemoryFlowStore};

/// Single-process deployment: one namespace, one board, one conductor.
pub struct Node {
    pub config: NodeConfig,
    pub namespace: MemoryNamespace,
    pub board: Arc<dyn Board>,
    pub flows: Arc<dyn FlowStore>,
    pub pool: WorkerPool,
    pub conductor: Arc<Conductor>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self, ConductorError> {
        let namespace = MemoryNamespace::new();
        let coordinator: Arc<dyn Coordinator> = Arc::new(namespace.connect());

        let board: Arc<dyn Board> = match config.board.kind {
            BoardKind::Flat => Arc::new(FlatBoard::new(&config.board, coordinator)),
            BoardKind::PerQueue => Arc::new(PerQueueBoard::new(&config.board, coordinator)),
        };
        let flows: Arc<dyn FlowStore> = Arc::new(MemoryFlowStore::new());
        let engine = Arc::new(ProcessEngine::new(
            Arc::clone(&flows),
            config.sandbox.clone(),
        ));
        let pool = WorkerPool::new(config.conductor.max_workers)?;
        let conductor = Arc::new(Conductor::new(
            Arc::clone(&board),
            engine,
            pool.clone(),
            &config.conductor,
        )?);

        Ok(Self {
            config,
            namespace,
            board,
            flows,
            pool,
            conductor,
        })
    }

    /// Run until `shutdown` fires or the conductor is stopped through the
    /// dashboard.
    ///
    /// 1. Connects the board (root watch and, per-queue, subtree watches)
    /// 2. Optionally spawns the dashboard
    /// 3. Runs the conductor loop
    /// 4. On shutdown stops claiming, lets in-flight executions resolve, then
    ///    closes the board
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        self.board.connect().await?;

        if let Some(addr) = self.config.dashboard_addr {
            let state = DashboardState {
                board: Arc::clone(&self.board),
                flows: Arc::clone(&self.flows),
                conductor: Arc::clone(&self.conductor),
                queue_key: self.config.board.queue_key.clone(),
            };
            tokio::spawn(run_dashboard(addr, state));
        }

        let conductor = Arc::clone(&self.conductor);
        let mut running = tokio::spawn(async move { conductor.run().await });

        tokio::select! {
            _ = shutdown.cancelled() => {
                self.conductor.stop();
                if let Err(e) = running.await {
                    tracing::error!(error = %e, "Conductor task failed");
                }
            }
            result = &mut running => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Conductor task failed");
                }
            }
        }

        self.pool.shutdown().await;
        self.board.close().await;
        tracing::info!(board = %self.board.name(), "Node shut down");
        Ok(())
    }
}
