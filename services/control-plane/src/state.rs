//! State handed to every request handler.

use std::future::Future;
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::error;

use crate::db::Database;
use crate::serving::{Orchestrator, ReconcileError};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    /// `None` when endpoints are kept in memory.
    db: Option<Database>,
    operations: TaskTracker,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, db: Option<Database>) -> Self {
        Self {
            orchestrator,
            db,
            operations: TaskTracker::new(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn db(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    /// Mutations still running; shutdown drains these.
    pub fn operations(&self) -> &TaskTracker {
        &self.operations
    }

    /// Run a mutating operation on its own task and wait for it. A client
    /// that disconnects only drops the wait; the state machine runs to a
    /// commit or a rollback either way.
    pub async fn run_operation<T, F, Fut>(&self, op: F) -> Result<T, ReconcileError>
    where
        F: FnOnce(Arc<Orchestrator>) -> Fut,
        Fut: Future<Output = Result<T, ReconcileError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.operations.spawn(op(self.orchestrator.clone()));
        handle.await.map_err(|e| {
            error!(error = %e, "Operation task failed");
            ReconcileError::Fatal(format!("operation task failed: {e}"))
        })?
    }
}
