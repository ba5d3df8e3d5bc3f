use std::{collections::HashSet, sync::Arc};

use alloy::primitives::Bytes;
use tokio::sync::oneshot;
use txm_core::{
    chain::ChainRpc,
    error::{ChainError, with_rpc_timeout},
};

use crate::{
    metrics::record_resent,
    txm::{
        config::TxmConfig,
        error::{SendErrorKind, TxmError},
        error_classifier::SendErrorClassifier,
        store::TxStore,
        types::now_ms,
    },
};

/// Periodic rebroadcast of transactions that stayed unconfirmed too long.
///
/// Only the best attempt of each transaction is resent, and no new attempts
/// are ever created here.
pub struct Resender<C, S> {
    chain: Arc<C>,
    store: Arc<S>,
    config: Arc<TxmConfig>,
    classifier: Arc<SendErrorClassifier>,
}

impl<C: ChainRpc, S: TxStore> Resender<C, S> {
    pub fn new(
        chain: Arc<C>,
        store: Arc<S>,
        config: Arc<TxmConfig>,
        classifier: Arc<SendErrorClassifier>,
    ) -> Self {
        Self {
            chain,
            store,
            config,
            classifier,
        }
    }

    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), TxmError> {
        let mut ticker = tokio::time::interval(self.config.resend_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(chain_id = self.chain.chain_id(), "Resender started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {}
            }

            match self.resend_stale().await {
                Ok(_) => {}
                Err(e) if e.is_fatal_to_process() => return Err(e),
                Err(e) => tracing::warn!(error = ?e, "Resend sweep failed"),
            }
        }

        tracing::info!(chain_id = self.chain.chain_id(), "Resender stopped");
        Ok(())
    }

    /// One sweep. Returns how many transactions were resent.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain.chain_id()))]
    pub async fn resend_stale(&self) -> Result<u64, TxmError> {
        let batch_size = self.config.rpc_batch_size.max(1);
        let older_than = now_ms().saturating_sub(self.config.resend_after_threshold_ms);
        let mut total = 0;
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let page = self.store.stale_unconfirmed(older_than, batch_size).await?;
            let page_len = page.len();
            // a touched transaction can reappear when broadcast_at did not move past the cutoff
            let due: Vec<_> = page
                .into_iter()
                .filter(|(tx, _)| seen.insert(tx.id.clone()))
                .collect();
            if due.is_empty() {
                break;
            }

            let raws: Vec<Bytes> = due
                .iter()
                .map(|(_, attempt)| attempt.signed_raw_transaction.clone())
                .collect();

            let results: Vec<Option<ChainError>> = match with_rpc_timeout(
                self.chain.chain_id(),
                self.config.rpc_timeout(),
                "eth_sendRawTransaction",
                async { Ok(self.chain.batch_submit_raw(&raws).await) },
            )
            .await
            {
                Ok(results) => results.into_iter().map(|r| r.err()).collect(),
                Err(e) => vec![Some(e); due.len()],
            };

            for ((tx, attempt), error) in due.iter().zip(results) {
                let Some(error) = error else {
                    continue;
                };
                match self.classifier.classify(&error) {
                    SendErrorKind::AlreadyKnown | SendErrorKind::NonceTooLow => {
                        tracing::debug!(tx_id = %tx.id, attempt_id = %attempt.id, "Resend not needed, node already has it");
                    }
                    kind => {
                        tracing::warn!(
                            tx_id = %tx.id,
                            attempt_id = %attempt.id,
                            kind = ?kind,
                            error = ?error,
                            "Resend failed, waiting for next sweep"
                        );
                    }
                }
            }

            // every item counts as sent, failed ones wait a full interval
            let ids: Vec<String> = due.iter().map(|(tx, _)| tx.id.clone()).collect();
            self.store.touch_broadcast_at(&ids, now_ms()).await?;

            total += due.len() as u64;
            if page_len < batch_size {
                break;
            }
        }

        if total > 0 {
            record_resent(self.chain.chain_id(), total);
            tracing::info!(resent = total, "Rebroadcast stale transactions");
        }
        Ok(total)
    }
}
