use alloy::primitives::{Address, Bytes};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use txm_core::{
    chain::ChainRpc,
    error::{ChainError, with_rpc_timeout},
    gas::GasEstimator,
    signer::TxSigner,
    transaction::UnsignedTransaction,
};

use crate::{
    metrics::{calculate_duration_seconds, record_fatal, record_transaction_queued_to_broadcast},
    txm::{
        context::TxmContext,
        error::{SendErrorKind, TxmError},
        store::{NonceRelease, TransactionStoreError, TxStore},
        types::{Attempt, AttemptState, Transaction, now_ms},
    },
};

/// What the queue loop does after one transaction was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFlow {
    /// The in-progress slot is free again.
    Next,
    /// The transaction is still `in_progress`; wait for the next wake.
    Stall,
}

/// Per-address worker: takes unstarted transactions in creation order,
/// assigns nonces and gets each one accepted by the node.
pub struct Broadcaster<C, T, S, G> {
    ctx: TxmContext<C, T, S, G>,
    from: Address,
    worker_id: String,
}

impl<C, T, S, G> Broadcaster<C, T, S, G>
where
    C: ChainRpc,
    T: TxSigner,
    S: TxStore,
    G: GasEstimator,
{
    pub fn new(ctx: TxmContext<C, T, S, G>, from: Address) -> Self {
        Self {
            ctx,
            from,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Hold the address lock and process the queue on every wake, poll tick
    /// or trigger until shutdown. A unit of work in flight always completes
    /// before shutdown is observed.
    #[tracing::instrument(name = "broadcaster", skip_all, fields(from = %self.from, chain_id = self.ctx.chain_id(), worker_id = %self.worker_id))]
    pub async fn run(
        self,
        mut wake_rx: mpsc::Receiver<()>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), TxmError> {
        if !self.acquire_lock(&mut shutdown_rx).await {
            tracing::info!("Shutdown requested before the address lock was taken");
            return Ok(());
        }
        tracing::info!("Broadcaster started");

        let mut poll = tokio::time::interval(self.ctx.config.broadcaster_poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown_rx => break Ok(()),
                woke = wake_rx.recv() => {
                    if woke.is_none() {
                        break Ok(());
                    }
                }
                _ = poll.tick() => {}
            }

            match self.process_queue(&mut shutdown_rx).await {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) if e.is_lock_lost() || e.is_fatal_to_process() => break Err(e),
                Err(e) => {
                    tracing::warn!(error = ?e, "Broadcaster pass failed, retrying on next wake");
                }
            }
        };

        match &result {
            Err(e) if e.is_lock_lost() => {
                tracing::error!(error = ?e, "Address lock taken over by another worker, stopping");
            }
            _ => {
                if let Err(e) = self
                    .ctx
                    .store
                    .release_address_lock(self.from, &self.worker_id)
                    .await
                {
                    tracing::error!(error = ?e, "Error releasing address lock");
                }
            }
        }

        tracing::info!("Broadcaster stopped");
        result
    }

    /// Take the address lock, retrying store errors with capped exponential
    /// backoff. Returns false if shutdown was requested first.
    async fn acquire_lock(&self, shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
        let base = self.ctx.config.send_retry_backoff();
        let cap = self.ctx.config.broadcaster_poll_interval().max(base);
        let mut failures: u32 = 0;

        loop {
            match self
                .ctx
                .store
                .acquire_address_lock(self.from, &self.worker_id)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    let delay = base.saturating_mul(1 << failures.min(10)).min(cap);
                    failures += 1;
                    tracing::warn!(
                        error = ?e,
                        failures = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to take address lock, retrying"
                    );
                    tokio::select! {
                        _ = &mut *shutdown_rx => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Drain the address queue: finish the in-progress transaction, then start
    /// unstarted ones until the queue is empty or a transaction stalls.
    /// Returns `true` when shutdown was requested between units.
    pub async fn process_queue(
        &self,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> Result<bool, TxmError> {
        if let Some(tx) = self.ctx.store.in_progress_for(self.from).await? {
            if self.resume(tx).await? == SendFlow::Stall {
                return Ok(false);
            }
        }

        loop {
            if shutdown_requested(shutdown_rx) {
                return Ok(true);
            }

            let Some(next) = self.ctx.store.next_unstarted(self.from).await? else {
                return Ok(false);
            };

            let tx = match self.start(&next).await {
                Ok(tx) => tx,
                // pruned by a queue strategy after we picked it
                Err(TxmError::Store {
                    source: TransactionStoreError::TransactionNotFound { .. },
                }) => continue,
                Err(e) => return Err(e),
            };

            if self.send_fresh(&tx, true).await? == SendFlow::Stall {
                return Ok(false);
            }
        }
    }

    /// Nonce assignment. The chain is only asked when the store has no counter.
    async fn start(&self, next: &Transaction) -> Result<Transaction, TxmError> {
        let chain_next_nonce = match self.ctx.store.last_nonce(self.from).await? {
            Some(_) => None,
            None => {
                let nonce = with_rpc_timeout(
                    self.ctx.chain_id(),
                    self.ctx.config.rpc_timeout(),
                    "eth_getTransactionCount",
                    self.ctx.chain.pending_nonce_at(self.from),
                )
                .await?;
                tracing::info!(nonce = nonce, "Synced nonce from chain");
                Some(nonce)
            }
        };

        let tx = self
            .ctx
            .store
            .start_transaction(&next.id, self.from, &self.worker_id, chain_next_nonce)
            .await?;

        tracing::info!(tx_id = %tx.id, nonce = ?tx.nonce, "Assigned nonce");
        Ok(tx)
    }

    /// Pick up a transaction left `in_progress` by a crash or a stalled pass.
    async fn resume(&self, tx: Transaction) -> Result<SendFlow, TxmError> {
        let attempts = self.ctx.store.attempts_for(&tx.id).await?;

        match attempts.last() {
            // signed and persisted, outcome unknown: resend the same bytes
            Some(attempt) => {
                tracing::info!(
                    tx_id = %tx.id,
                    attempt_id = %attempt.id,
                    attempt_state = ?attempt.state,
                    "Resuming in-progress transaction"
                );
                self.submit_attempt(&tx, attempt, false).await
            }
            None => self.send_fresh(&tx, true).await,
        }
    }

    /// Sign and persist a new attempt at the assigned nonce, then submit it.
    async fn send_fresh(&self, tx: &Transaction, first_attempt: bool) -> Result<SendFlow, TxmError> {
        let nonce = tx.nonce.ok_or_else(|| TxmError::Invariant {
            message: format!("in-progress transaction {} has no nonce", tx.id),
        })?;

        let quote = match with_rpc_timeout(
            self.ctx.chain_id(),
            self.ctx.config.rpc_timeout(),
            "gas_quote",
            self.ctx.gas.quote(tx.gas_limit),
        )
        .await
        {
            Ok(quote) => quote,
            Err(e) => {
                tracing::warn!(tx_id = %tx.id, error = ?e, "Failed to price transaction");
                return Ok(SendFlow::Stall);
            }
        };

        let unsigned = UnsignedTransaction {
            chain_id: tx.chain_id,
            nonce,
            to: tx.to,
            value: tx.value,
            input: tx.data.clone(),
            gas_limit: quote.gas_limit,
            gas_price: quote.gas_price,
        };
        let signed = self.ctx.signer.sign(self.from, &unsigned).await?;

        let attempt = Attempt {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: tx.id.clone(),
            gas_price: quote.gas_price,
            hash: signed.hash,
            signed_raw_transaction: signed.raw,
            state: AttemptState::InProgress,
            created_at: now_ms(),
        };
        // persisted before the network call, so a crash can resume it
        self.ctx.store.insert_attempt(attempt.clone()).await?;

        tracing::debug!(
            tx_id = %tx.id,
            attempt_id = %attempt.id,
            nonce = nonce,
            gas_price = %attempt.gas_price,
            hash = %attempt.hash,
            "Signed attempt"
        );

        self.submit_attempt(tx, &attempt, first_attempt).await
    }

    /// Submit one attempt and record the outcome.
    ///
    /// `first_attempt` is true only when this attempt is the first one ever
    /// signed for the transaction in this pass, so a rejection proves the
    /// nonce never reached a mempool.
    async fn submit_attempt(
        &self,
        tx: &Transaction,
        attempt: &Attempt,
        first_attempt: bool,
    ) -> Result<SendFlow, TxmError> {
        let outcome = self.submit_with_retry(&attempt.signed_raw_transaction).await;

        let (kind, error) = match outcome {
            None => (None, None),
            Some((kind, error)) => (Some(kind), Some(error)),
        };

        match kind {
            None | Some(SendErrorKind::AlreadyKnown) => {
                self.mark_broadcast(tx, attempt).await?;
                Ok(SendFlow::Next)
            }
            Some(SendErrorKind::InsufficientFunds) => {
                self.ctx
                    .store
                    .mark_insufficient_funds(&tx.id, &attempt.id)
                    .await?;
                tracing::warn!(
                    tx_id = %tx.id,
                    attempt_id = %attempt.id,
                    error = ?error,
                    "Insufficient funds, address stalled until funded"
                );
                Ok(SendFlow::Stall)
            }
            Some(SendErrorKind::NonceTooLow) if !first_attempt => {
                // an earlier send of this nonce may have been mined
                tracing::info!(
                    tx_id = %tx.id,
                    attempt_id = %attempt.id,
                    "Nonce already used, handing transaction to the confirmer"
                );
                self.mark_broadcast(tx, attempt).await?;
                Ok(SendFlow::Next)
            }
            Some(SendErrorKind::NonceTooLow) => {
                self.mark_fatal(tx, error, NonceRelease::Resync).await?;
                Ok(SendFlow::Next)
            }
            Some(SendErrorKind::Fatal) => {
                let release = if first_attempt {
                    NonceRelease::Rollback
                } else {
                    NonceRelease::Keep
                };
                self.mark_fatal(tx, error, release).await?;
                Ok(SendFlow::Next)
            }
            Some(SendErrorKind::Transient) => {
                tracing::warn!(
                    tx_id = %tx.id,
                    attempt_id = %attempt.id,
                    error = ?error,
                    "Send retries exhausted, transaction stays in progress"
                );
                Ok(SendFlow::Stall)
            }
        }
    }

    /// `None` when the node accepted the transaction. Transient failures are
    /// retried with exponential backoff and jitter.
    async fn submit_with_retry(&self, raw: &Bytes) -> Option<(SendErrorKind, ChainError)> {
        let max_attempts = self.ctx.config.send_retry_attempts.max(1);
        let base_ms = self.ctx.config.send_retry_backoff_ms;
        let mut try_number = 1;

        loop {
            let result = with_rpc_timeout(
                self.ctx.chain_id(),
                self.ctx.config.rpc_timeout(),
                "eth_sendRawTransaction",
                self.ctx.chain.submit_raw(raw),
            )
            .await;

            let error = match result {
                Ok(()) => return None,
                Err(e) => e,
            };
            let kind = self.ctx.classifier.classify(&error);
            if kind != SendErrorKind::Transient || try_number >= max_attempts {
                return Some((kind, error));
            }

            let jitter_ms = rand::rng().random_range(0..=base_ms / 2);
            let delay_ms = base_ms.saturating_mul(1 << (try_number - 1).min(6)) + jitter_ms;
            tracing::debug!(
                try_number = try_number,
                delay_ms = delay_ms,
                error = ?error,
                "Transient send failure, retrying"
            );
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            try_number += 1;
        }
    }

    async fn mark_broadcast(&self, tx: &Transaction, attempt: &Attempt) -> Result<(), TxmError> {
        let now = now_ms();
        let updated = self
            .ctx
            .store
            .mark_broadcast(&tx.id, &attempt.id, now)
            .await?;

        if tx.initial_broadcast_at.is_none() {
            record_transaction_queued_to_broadcast(
                self.ctx.chain_id(),
                calculate_duration_seconds(updated.created_at, now),
            );
        }
        tracing::info!(
            tx_id = %tx.id,
            attempt_id = %attempt.id,
            nonce = ?updated.nonce,
            hash = %attempt.hash,
            "Transaction broadcast"
        );
        Ok(())
    }

    async fn mark_fatal(
        &self,
        tx: &Transaction,
        error: Option<ChainError>,
        release: NonceRelease,
    ) -> Result<(), TxmError> {
        let message = error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "rejected by node".to_string());
        self.ctx
            .store
            .mark_fatal(&tx.id, &message, release, now_ms())
            .await?;

        record_fatal(self.ctx.chain_id());
        tracing::error!(
            tx_id = %tx.id,
            nonce = ?tx.nonce,
            release = ?release,
            error = %message,
            "Transaction rejected by node, marked fatal"
        );
        Ok(())
    }
}

/// Non-blocking check of the shutdown signal. A dropped sender counts as shutdown.
fn shutdown_requested(shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(
        shutdown_rx.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}
