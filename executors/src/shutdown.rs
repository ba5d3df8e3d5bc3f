use tokio::{sync::oneshot, task::JoinHandle};

use crate::txm::error::TxmError;

/// Handle for one background worker that can be stopped gracefully.
pub struct WorkerHandle {
    pub name: String,
    pub join_handle: JoinHandle<Result<(), TxmError>>,
    pub shutdown_tx: oneshot::Sender<()>,
}

impl WorkerHandle {
    /// Spawn `worker` with a fresh shutdown channel.
    pub fn spawn<F, Fut>(name: impl Into<String>, worker: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = Result<(), TxmError>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            name: name.into(),
            join_handle: tokio::spawn(worker(shutdown_rx)),
            shutdown_tx,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Collect the result of a worker that already exited on its own.
    pub async fn join(self) -> Result<(), TxmError> {
        join_worker(&self.name, self.join_handle).await
    }

    pub async fn shutdown(self) -> Result<(), TxmError> {
        tracing::info!(worker = %self.name, "Initiating graceful shutdown of worker");

        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!(worker = %self.name, "Worker was already shutting down");
        }

        join_worker(&self.name, self.join_handle).await
    }
}

async fn join_worker(
    name: &str,
    join_handle: JoinHandle<Result<(), TxmError>>,
) -> Result<(), TxmError> {
    match join_handle.await {
        Ok(Ok(())) => {
            tracing::debug!(worker = %name, "Worker shut down gracefully");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!(worker = %name, error = ?e, "Worker shut down with error");
            Err(e)
        }
        Err(e) => {
            tracing::error!(worker = %name, error = ?e, "Worker task panicked");
            Err(TxmError::Worker {
                message: format!("Worker {name} panic: {e}"),
            })
        }
    }
}

/// Coordinates shutdown of a group of workers.
#[derive(Default)]
pub struct ShutdownHandle {
    workers: Vec<WorkerHandle>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker first, then wait for all of them. The first error
    /// is returned; all of them are logged.
    pub async fn shutdown(self) -> Result<(), TxmError> {
        let worker_count = self.workers.len();
        tracing::info!(worker_count, "Initiating graceful shutdown of workers");

        let mut pending = Vec::with_capacity(worker_count);
        for worker in self.workers {
            if worker.shutdown_tx.send(()).is_err() {
                tracing::debug!(worker = %worker.name, "Worker was already shutting down");
            }
            pending.push((worker.name, worker.join_handle));
        }

        let results = futures::future::join_all(
            pending
                .into_iter()
                .map(|(name, handle)| async move { join_worker(&name, handle).await }),
        )
        .await;

        let mut errors = results.into_iter().filter_map(Result::err);
        match errors.next() {
            None => {
                tracing::info!(worker_count, "All workers shut down gracefully");
                Ok(())
            }
            Some(first) => Err(first),
        }
    }
}
