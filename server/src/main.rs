use std::sync::Arc;

use txm_core::{AlloyChain, LocalKeyStore, RpcGasEstimator};
use txm_executors::{
    metrics::{TxmMetrics, initialize_metrics},
    txm::{MemoryTxStore, RedisTxStore, TxManager, TxStore},
};
use txm_node::{
    NodeConfig, NodeServer, NodeServerState, StoreBackend,
    config::{self, LogFormat},
};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "txm_node=debug,txm_executors=debug,txm_core=info,tower_http=debug".into()
        }),
    );

    match config.server.log_format {
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let registry = Arc::new(prometheus::Registry::new());
    initialize_metrics(TxmMetrics::new(&registry)?);
    tracing::info!("Metrics registry initialized");

    match config.store.backend {
        StoreBackend::Redis => {
            let client = redis::Client::open(config.store.redis_url.as_str())?;
            let store = RedisTxStore::new(
                client,
                config.chain.chain_id,
                config.store.namespace.clone(),
            )
            .await?;
            tracing::info!("Redis transaction store initialized");
            run_node(config, Arc::new(store), registry).await
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory transaction store, state is lost on restart");
            let store = MemoryTxStore::new(config.chain.chain_id);
            run_node(config, Arc::new(store), registry).await
        }
    }
}

async fn run_node<S: TxStore>(
    config: NodeConfig,
    store: Arc<S>,
    registry: Arc<prometheus::Registry>,
) -> anyhow::Result<()> {
    let chain = Arc::new(AlloyChain::new(
        config.chain.chain_id,
        &config.chain.rpc_url,
    )?);
    let keys = Arc::new(LocalKeyStore::from_private_keys(config.keys.private_keys.as_slice())?);
    if config.keys.private_keys.is_empty() {
        tracing::warn!("No private keys configured, no transactions will be sent");
    }
    let gas = Arc::new(RpcGasEstimator::new(chain.clone()).with_floor(config.chain.gas_price_floor));

    let manager = Arc::new(TxManager::new(
        chain,
        keys.clone(),
        keys,
        store,
        gas,
        config.txm.clone(),
    )?);

    manager.start().await?;

    let mut server = NodeServer::new(NodeServerState {
        manager: manager.clone(),
        metrics_registry: registry,
    });

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    server.start(listener)?;

    tracing::info!(
        chain_id = config.chain.chain_id,
        "Node started, waiting for shutdown signal"
    );

    let mut exit: anyhow::Result<()> = Ok(());
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Shutdown signal received");
        }
        fatal = manager.wait_fatal() => {
            if let Some(e) = fatal {
                tracing::error!(error = ?e, "Transaction manager hit an unrecoverable error");
                exit = Err(e.into());
            }
        }
    }

    tracing::info!("Starting coordinated shutdown");

    if let Err(e) = server.shutdown().await {
        tracing::error!("Error shutting down HTTP server: {}", e);
    } else {
        tracing::info!("HTTP server shut down successfully");
    }

    if let Err(e) = manager.stop().await {
        tracing::error!(error = ?e, "Error stopping transaction manager");
    } else {
        tracing::info!("Transaction manager stopped successfully");
    }

    exit
}
