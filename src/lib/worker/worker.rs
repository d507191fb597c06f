use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::{Job, Worker, WorkerError, WorkerResult};
use crate::engine::{Engine, Workflow};
use crate::error::StandResult;

impl Worker {
    /// Spawn the job loop. It ends once every `Worker` clone is dropped.
    pub fn start(engine: Arc<Engine>) -> (Self, JoinHandle<()>) {
        let (queue, jobs) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_jobs(engine.clone(), jobs));
        (Worker { engine, queue }, handle)
    }

    fn enqueue(&self, workflow: Workflow, reply: Option<oneshot::Sender<StandResult<()>>>) -> WorkerResult<uuid::Uuid> {
        let id = uuid::Uuid::new_v4();
        self.queue
            .send(Job { id, workflow, reply })
            .map_err(|_| WorkerError::QueueClosed)?;
        tracing::info!(job = %id, workflow = %workflow, "New task");
        Ok(id)
    }

    /// Queue `workflow` and wait for its outcome, after everything queued before it.
    pub async fn run_sync(&self, workflow: Workflow) -> WorkerResult<StandResult<()>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(workflow, Some(tx))?;
        rx.await.map_err(|_| WorkerError::Dropped)
    }

    /// Queue `workflow` without waiting; its failure lands in the task status.
    pub fn submit(&self, workflow: Workflow) -> WorkerResult<uuid::Uuid> {
        self.enqueue(workflow, None)
    }
}

pub async fn run_jobs(engine: Arc<Engine>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        tracing::debug!(job = %job.id, workflow = %job.workflow, "Task picked up");
        match job.reply {
            Some(reply) => {
                let result = engine.run(job.workflow).await;
                if let Err(e) = &result {
                    tracing::error!(job = %job.id, error = %e, "Task failed");
                }
                if reply.send(result).is_err() {
                    tracing::warn!(job = %job.id, "Caller went away before the task finished");
                }
            }
            None => engine.log_and_continue(job.workflow).await,
        }
        tracing::debug!(job = %job.id, "Task completed");
    }
    tracing::info!("Task queue closed");
}
