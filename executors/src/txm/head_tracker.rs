use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use txm_core::{
    chain::ChainRpc,
    error::{ChainError, with_rpc_timeout},
    transaction::Head,
};

use crate::txm::{config::TxmConfig, error::TxmError};

/// Polls the latest head and publishes every change, including a new hash at
/// the same height.
pub struct HeadTracker<C> {
    chain: Arc<C>,
    config: Arc<TxmConfig>,
    heads: Arc<watch::Sender<Option<Head>>>,
}

impl<C: ChainRpc> HeadTracker<C> {
    pub fn new(
        chain: Arc<C>,
        config: Arc<TxmConfig>,
        heads: Arc<watch::Sender<Option<Head>>>,
    ) -> Self {
        Self {
            chain,
            config,
            heads,
        }
    }

    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), TxmError> {
        let mut ticker = tokio::time::interval(self.config.head_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.poll_once().await {
                tracing::warn!(chain_id = self.chain.chain_id(), error = ?e, "Failed to fetch latest head");
            }
        }
        Ok(())
    }

    /// Returns whether a new head was published.
    pub async fn poll_once(&self) -> Result<bool, ChainError> {
        let head = with_rpc_timeout(
            self.chain.chain_id(),
            self.config.rpc_timeout(),
            "eth_getBlockByNumber",
            self.chain.latest_head(),
        )
        .await?;

        let published = self.heads.send_if_modified(|current| {
            if current.as_ref() == Some(&head) {
                return false;
            }
            if let Some(previous) = current.as_ref() {
                if head.number <= previous.number {
                    tracing::warn!(
                        previous_number = previous.number,
                        previous_hash = %previous.hash,
                        number = head.number,
                        hash = %head.hash,
                        "Head moved sideways or backwards, possible reorg"
                    );
                }
            }
            *current = Some(head);
            true
        });

        if published {
            tracing::debug!(block_number = head.number, hash = %head.hash, "New head");
        }
        Ok(published)
    }
}
