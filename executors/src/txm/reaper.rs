use std::sync::Arc;

use tokio::sync::oneshot;

use crate::{
    metrics::record_reaped,
    txm::{config::TxmConfig, error::TxmError, store::TxStore, types::now_ms},
};

/// Deletes terminal transactions past the retention window.
pub struct Reaper<S> {
    chain_id: u64,
    store: Arc<S>,
    config: Arc<TxmConfig>,
}

impl<S: TxStore> Reaper<S> {
    pub fn new(chain_id: u64, store: Arc<S>, config: Arc<TxmConfig>) -> Self {
        Self {
            chain_id,
            store,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), TxmError> {
        let mut ticker = tokio::time::interval(self.config.reap_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {}
            }

            match self.reap_once().await {
                Ok(_) => {}
                Err(e) if e.is_fatal_to_process() => return Err(e),
                Err(e) => tracing::warn!(chain_id = self.chain_id, error = ?e, "Reap sweep failed"),
            }
        }
        Ok(())
    }

    pub async fn reap_once(&self) -> Result<u64, TxmError> {
        let older_than = now_ms().saturating_sub(self.config.reap_threshold_ms);
        let reaped = self.store.reap(older_than).await?;

        if reaped > 0 {
            record_reaped(self.chain_id, reaped);
            tracing::info!(chain_id = self.chain_id, reaped = reaped, "Reaped terminal transactions");
        }
        Ok(reaped)
    }
}
