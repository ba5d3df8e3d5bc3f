use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use prometheus::Registry;
use tokio::{sync::watch, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use txm_core::{AlloyChain, LocalKeyStore, RpcGasEstimator};
use txm_executors::txm::{TxManager, TxStore};

use super::routes::{
    health::health,
    metrics::get_metrics,
    transactions::{create_transaction, get_transaction},
};

/// The transaction manager as wired by the node: HTTP chain, local keys.
pub type NodeTxManager<S> =
    TxManager<AlloyChain, LocalKeyStore, LocalKeyStore, S, RpcGasEstimator<AlloyChain>>;

pub struct NodeServerState<S> {
    pub manager: Arc<NodeTxManager<S>>,
    pub metrics_registry: Arc<Registry>,
}

impl<S> Clone for NodeServerState<S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            metrics_registry: self.metrics_registry.clone(),
        }
    }
}

pub fn router<S: TxStore>(state: NodeServerState<S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/v1/transactions", post(create_transaction::<S>))
        .route("/v1/transactions/{id}", get(get_transaction::<S>))
        .route("/health", get(health::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct NodeServer {
    handle: Option<JoinHandle<Result<(), std::io::Error>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    app: Router,
}

impl NodeServer {
    pub fn new<S: TxStore>(state: NodeServerState<S>) -> Self {
        Self {
            handle: None,
            shutdown_tx: None,
            app: router(state),
        }
    }

    pub fn start(&mut self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = self.app.clone();
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            tracing::info!("HTTP server starting on {}", local_addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut rx = shutdown_rx;
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    tracing::info!("HTTP server shutting down");
                })
                .await
        });

        self.handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(true).is_err() {
                tracing::error!("Failed to send shutdown signal to HTTP server");
            }
        }

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(result) => {
                    if let Err(e) = result {
                        tracing::error!("HTTP server error during shutdown: {}", e);
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to join HTTP server task: {}", e);
                    return Err(std::io::Error::other(format!("Task join error: {e}")));
                }
            }
        }

        Ok(())
    }
}
