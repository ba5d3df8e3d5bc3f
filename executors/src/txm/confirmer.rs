use std::{collections::HashMap, sync::Arc};

use alloy::primitives::B256;
use tokio::sync::{oneshot, watch};
use txm_core::{
    chain::ChainRpc,
    error::{ChainError, with_rpc_timeout},
    transaction::{Head, Receipt},
};

use crate::{
    metrics::{calculate_duration_seconds, record_reorg_demotion, record_transaction_queued_to_confirmed},
    txm::{
        config::TxmConfig,
        error::TxmError,
        store::{TransactionStoreError, TxStore},
        types::{Confirmation, Transaction, TxState, now_ms},
    },
};

/// State changes made by one confirmer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmerReport {
    pub confirmed: Vec<String>,
    pub reorged: Vec<String>,
    pub missing_receipt: Vec<String>,
}

impl ConfirmerReport {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.reorged.is_empty() && self.missing_receipt.is_empty()
    }
}

/// Head-driven reconciliation of broadcast transactions against receipts.
pub struct Confirmer<C, S> {
    chain: Arc<C>,
    store: Arc<S>,
    config: Arc<TxmConfig>,
}

impl<C: ChainRpc, S: TxStore> Confirmer<C, S> {
    pub fn new(chain: Arc<C>, store: Arc<S>, config: Arc<TxmConfig>) -> Self {
        Self {
            chain,
            store,
            config,
        }
    }

    pub async fn run(
        self,
        mut heads: watch::Receiver<Option<Head>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), TxmError> {
        tracing::info!(chain_id = self.chain.chain_id(), "Confirmer started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                changed = heads.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let Some(head) = *heads.borrow_and_update() else {
                continue;
            };

            match self.process_head(head).await {
                Ok(_) => {}
                Err(e) if e.is_fatal_to_process() => return Err(e),
                Err(e) => {
                    tracing::warn!(block_number = head.number, error = ?e, "Confirmer run failed");
                }
            }
        }

        tracing::info!(chain_id = self.chain.chain_id(), "Confirmer stopped");
        Ok(())
    }

    /// Reconcile the store against `head`. Running it again on the same head
    /// with no new receipts changes nothing.
    #[tracing::instrument(skip_all, fields(chain_id = self.chain.chain_id(), block_number = head.number))]
    pub async fn process_head(&self, head: Head) -> Result<ConfirmerReport, TxmError> {
        let mut report = ConfirmerReport::default();

        self.revalidate_confirmed(head, &mut report).await?;
        self.check_unconfirmed(head, &mut report).await?;

        if !report.is_empty() {
            tracing::info!(
                confirmed = report.confirmed.len(),
                reorged = report.reorged.len(),
                missing_receipt = report.missing_receipt.len(),
                "Confirmer run complete"
            );
        }
        Ok(report)
    }

    /// Demote confirmations within the finality window whose block is no
    /// longer canonical.
    async fn revalidate_confirmed(
        &self,
        head: Head,
        report: &mut ConfirmerReport,
    ) -> Result<(), TxmError> {
        let min_block = head.number.saturating_sub(self.config.finality_depth);
        let confirmed: Vec<(Transaction, Confirmation)> = self
            .store
            .confirmed_since(min_block)
            .await?
            .into_iter()
            .filter_map(|tx| {
                let confirmation = tx.confirmation.clone()?;
                Some((tx, confirmation))
            })
            .collect();
        if confirmed.is_empty() {
            return Ok(());
        }

        let hashes: Vec<B256> = confirmed.iter().map(|(_, c)| c.tx_hash).collect();
        let receipts = self.fetch_receipts(&hashes).await?;

        for ((tx, confirmation), receipt) in confirmed.iter().zip(receipts) {
            let canonical = match receipt {
                Ok(Some(receipt)) => receipt.block_hash == confirmation.block_hash,
                Ok(None) => false,
                Err(e) => {
                    tracing::debug!(tx_id = %tx.id, error = ?e, "Receipt lookup failed, skipping revalidation");
                    continue;
                }
            };
            if canonical {
                continue;
            }

            match self.store.mark_reorged(&tx.id, confirmation.block_hash).await {
                Ok(_) => {
                    record_reorg_demotion(tx.chain_id);
                    tracing::warn!(
                        tx_id = %tx.id,
                        nonce = ?tx.nonce,
                        reorged_block_number = confirmation.block_number,
                        reorged_block_hash = %confirmation.block_hash,
                        "Confirmation block left the canonical chain, demoted to unconfirmed"
                    );
                    report.reorged.push(tx.id.clone());
                }
                Err(TransactionStoreError::UnexpectedState { .. }) => {
                    tracing::debug!(tx_id = %tx.id, "Transaction changed concurrently, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn check_unconfirmed(
        &self,
        head: Head,
        report: &mut ConfirmerReport,
    ) -> Result<(), TxmError> {
        let pending = self.store.unconfirmed_with_attempts().await?;
        if pending.is_empty() {
            tracing::debug!("No unconfirmed transactions");
            return Ok(());
        }

        // every attempt is looked up, a cheaper one may be the one mined
        let hashes: Vec<B256> = pending
            .iter()
            .flat_map(|(_, attempts)| attempts.iter().map(|a| a.hash))
            .collect();
        let results = self.fetch_receipts(&hashes).await?;

        let mut receipts: HashMap<B256, Receipt> = HashMap::new();
        let mut failed: Vec<B256> = Vec::new();
        for (hash, result) in hashes.iter().zip(results) {
            match result {
                Ok(Some(receipt)) => {
                    receipts.insert(*hash, receipt);
                }
                Ok(None) => {}
                Err(_) => failed.push(*hash),
            }
        }

        let now = now_ms();
        let missing_before = now.saturating_sub(self.config.missing_receipt_threshold_ms);

        for (tx, attempts) in pending {
            let receipt = attempts
                .iter()
                .rev()
                .find_map(|a| receipts.get(&a.hash));

            match receipt {
                Some(receipt)
                    if receipt.block_number + self.config.min_confirmations <= head.number =>
                {
                    self.confirm(&tx, receipt, now, report).await?;
                }
                Some(receipt) => {
                    tracing::debug!(
                        tx_id = %tx.id,
                        receipt_block = receipt.block_number,
                        "Receipt found, waiting for confirmations"
                    );
                }
                None => {
                    let lookup_failed = attempts.iter().any(|a| failed.contains(&a.hash));
                    let first_sent = tx.initial_broadcast_at.or(tx.broadcast_at);
                    let stale = first_sent.is_some_and(|at| at <= missing_before);

                    if tx.state == TxState::Unconfirmed && stale && !lookup_failed {
                        match self.store.mark_missing_receipt(&tx.id).await {
                            Ok(()) => {
                                tracing::warn!(
                                    tx_id = %tx.id,
                                    nonce = ?tx.nonce,
                                    "No receipt long after broadcast, marked confirmed_missing_receipt"
                                );
                                report.missing_receipt.push(tx.id.clone());
                            }
                            Err(TransactionStoreError::UnexpectedState { .. }) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn confirm(
        &self,
        tx: &Transaction,
        receipt: &Receipt,
        now: u64,
        report: &mut ConfirmerReport,
    ) -> Result<(), TxmError> {
        let confirmation = Confirmation {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            block_hash: receipt.block_hash,
            status: receipt.status,
            gas_used: receipt.gas_used,
            confirmed_at: now,
        };

        match self
            .store
            .mark_confirmed(&tx.id, tx.state, confirmation)
            .await
        {
            Ok(_) => {
                record_transaction_queued_to_confirmed(
                    tx.chain_id,
                    calculate_duration_seconds(tx.created_at, now),
                );
                tracing::info!(
                    tx_id = %tx.id,
                    nonce = ?tx.nonce,
                    hash = %receipt.tx_hash,
                    receipt_block = receipt.block_number,
                    status = receipt.status,
                    "Transaction confirmed"
                );
                report.confirmed.push(tx.id.clone());
                Ok(())
            }
            Err(TransactionStoreError::UnexpectedState { .. }) => {
                tracing::debug!(tx_id = %tx.id, "Transaction changed concurrently, skipping");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receipt lookups chunked by the RPC batch size, one result per hash.
    async fn fetch_receipts(
        &self,
        hashes: &[B256],
    ) -> Result<Vec<Result<Option<Receipt>, ChainError>>, TxmError> {
        let mut results = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(self.config.rpc_batch_size.max(1)) {
            let chunk_results = with_rpc_timeout(
                self.chain.chain_id(),
                self.config.rpc_timeout(),
                "eth_getTransactionReceipt",
                async { Ok(self.chain.get_receipts(chunk).await) },
            )
            .await?;
            results.extend(chunk_results);
        }
        Ok(results)
    }
}
