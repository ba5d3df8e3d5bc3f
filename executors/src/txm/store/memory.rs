use std::collections::HashMap;

use alloy::primitives::{Address, B256};
use tokio::sync::Mutex;

use crate::txm::{
    store::{
        CreateOutcome, NonceRelease, TransactionStoreError, TxStore, check_monotonic,
        expect_state, released_counter,
    },
    types::{Attempt, AttemptState, Confirmation, Transaction, TxState, best_attempt},
};

#[derive(Default)]
struct Inner {
    transactions: HashMap<String, Transaction>,
    attempts: HashMap<String, Vec<Attempt>>,
    /// Creation sequence, the FIFO order within an address.
    sequence: HashMap<String, u64>,
    next_sequence: u64,
    idempotency: HashMap<(Address, String), String>,
    last_nonce: HashMap<Address, u64>,
    in_progress: HashMap<Address, String>,
    locks: HashMap<Address, String>,
}

impl Inner {
    fn tx(&self, id: &str) -> Result<&Transaction, TransactionStoreError> {
        self.transactions
            .get(id)
            .ok_or_else(|| TransactionStoreError::TransactionNotFound {
                transaction_id: id.to_string(),
            })
    }

    fn tx_mut(&mut self, id: &str) -> Result<&mut Transaction, TransactionStoreError> {
        self.transactions
            .get_mut(id)
            .ok_or_else(|| TransactionStoreError::TransactionNotFound {
                transaction_id: id.to_string(),
            })
    }

    fn attempt_mut(
        &mut self,
        transaction_id: &str,
        attempt_id: &str,
    ) -> Result<&mut Attempt, TransactionStoreError> {
        self.attempts
            .get_mut(transaction_id)
            .and_then(|attempts| attempts.iter_mut().find(|a| a.id == attempt_id))
            .ok_or_else(|| TransactionStoreError::AttemptNotFound {
                transaction_id: transaction_id.to_string(),
                attempt_id: attempt_id.to_string(),
            })
    }

    fn count_non_terminal(&self, from: Address) -> u64 {
        self.transactions
            .values()
            .filter(|tx| tx.from == from && tx.state.counts_toward_queue())
            .count() as u64
    }

    /// Unstarted ids for the address, oldest first.
    fn unstarted(&self, from: Address) -> Vec<&Transaction> {
        let mut unstarted: Vec<&Transaction> = self
            .transactions
            .values()
            .filter(|tx| tx.from == from && tx.state == TxState::Unstarted)
            .collect();
        unstarted.sort_by_key(|tx| self.sequence.get(&tx.id).copied().unwrap_or_default());
        unstarted
    }

    fn remove(&mut self, id: &str) {
        if let Some(tx) = self.transactions.remove(id) {
            if let Some(key) = tx.idempotency_key {
                self.idempotency.remove(&(tx.from, key));
            }
        }
        self.attempts.remove(id);
        self.sequence.remove(id);
    }
}

/// In-process [`TxStore`]. Every operation runs under one mutex, which makes
/// each of them trivially atomic.
pub struct MemoryTxStore {
    chain_id: u64,
    inner: Mutex<Inner>,
}

impl MemoryTxStore {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// All transactions of an address, in creation order.
    pub async fn transactions_for(&self, from: Address) -> Vec<Transaction> {
        let inner = self.inner.lock().await;
        let mut txs: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|tx| tx.from == from)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| inner.sequence.get(&tx.id).copied().unwrap_or_default());
        txs
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.transactions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a stored transaction. Lets tests age records without sleeping.
    pub async fn update_transaction(&self, tx: Transaction) {
        self.inner
            .lock()
            .await
            .transactions
            .insert(tx.id.clone(), tx);
    }
}

impl TxStore for MemoryTxStore {
    async fn find_by_idempotency_key(
        &self,
        from: Address,
        key: &str,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .idempotency
            .get(&(from, key.to_string()))
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn create_transaction(
        &self,
        tx: Transaction,
        limit: u64,
    ) -> Result<CreateOutcome, TransactionStoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(key) = &tx.idempotency_key {
            if let Some(existing) = inner
                .idempotency
                .get(&(tx.from, key.clone()))
                .and_then(|id| inner.transactions.get(id))
            {
                return Ok(CreateOutcome::Existing(existing.clone()));
            }
        }

        let count = inner.count_non_terminal(tx.from);
        if limit > 0 && count >= limit {
            return Ok(CreateOutcome::QueueFull { count, limit });
        }

        if let Some(key) = &tx.idempotency_key {
            inner
                .idempotency
                .insert((tx.from, key.clone()), tx.id.clone());
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.sequence.insert(tx.id.clone(), sequence);
        inner.transactions.insert(tx.id.clone(), tx.clone());

        Ok(CreateOutcome::Created(tx))
    }

    async fn prune_unstarted(
        &self,
        from: Address,
        subject: &str,
        keep: u64,
    ) -> Result<u64, TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let matching: Vec<String> = inner
            .unstarted(from)
            .into_iter()
            .filter(|tx| tx.subject.as_deref() == Some(subject))
            .map(|tx| tx.id.clone())
            .collect();

        let excess = (matching.len() as u64).saturating_sub(keep);
        for id in matching.iter().take(excess as usize) {
            inner.remove(id);
        }
        Ok(excess)
    }

    async fn count_non_terminal(&self, from: Address) -> Result<u64, TransactionStoreError> {
        Ok(self.inner.lock().await.count_non_terminal(from))
    }

    async fn next_unstarted(
        &self,
        from: Address,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.unstarted(from).first().map(|tx| (*tx).clone()))
    }

    async fn in_progress_for(
        &self,
        from: Address,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .in_progress
            .get(&from)
            .and_then(|id| inner.transactions.get(id))
            .cloned())
    }

    async fn last_nonce(&self, from: Address) -> Result<Option<u64>, TransactionStoreError> {
        Ok(self.inner.lock().await.last_nonce.get(&from).copied())
    }

    async fn acquire_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.locks.insert(from, worker_id.to_string()) {
            if previous != worker_id {
                tracing::warn!(
                    from = %from,
                    chain_id = self.chain_id,
                    worker_id = %worker_id,
                    previous_worker_id = %previous,
                    "Forcefully taking over address lock from stalled worker"
                );
            }
        }
        Ok(())
    }

    async fn release_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.locks.get(&from).map(String::as_str) == Some(worker_id) {
            inner.locks.remove(&from);
        }
        Ok(())
    }

    async fn start_transaction(
        &self,
        transaction_id: &str,
        from: Address,
        worker_id: &str,
        chain_next_nonce: Option<u64>,
    ) -> Result<Transaction, TransactionStoreError> {
        let mut inner = self.inner.lock().await;

        if inner.locks.get(&from).map(String::as_str) != Some(worker_id) {
            return Err(TransactionStoreError::LockLost {
                from,
                chain_id: self.chain_id,
                worker_id: worker_id.to_string(),
            });
        }
        if let Some(occupant) = inner.in_progress.get(&from) {
            return Err(TransactionStoreError::InProgressSlotOccupied {
                from,
                transaction_id: occupant.clone(),
            });
        }
        expect_state(inner.tx(transaction_id)?, TxState::Unstarted)?;

        let nonce = match (inner.last_nonce.get(&from), chain_next_nonce) {
            (Some(last), _) => last + 1,
            (None, Some(next)) => next,
            (None, None) => {
                return Err(TransactionStoreError::NonceSyncRequired {
                    from,
                    chain_id: self.chain_id,
                });
            }
        };

        inner.last_nonce.insert(from, nonce);
        inner.in_progress.insert(from, transaction_id.to_string());
        let tx = inner.tx_mut(transaction_id)?;
        tx.nonce = Some(nonce);
        tx.state = TxState::InProgress;
        Ok(tx.clone())
    }

    async fn insert_attempt(&self, attempt: Attempt) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let tx = inner.tx(&attempt.transaction_id)?;
        if !matches!(tx.state, TxState::InProgress | TxState::Unconfirmed) {
            return Err(TransactionStoreError::UnexpectedState {
                transaction_id: tx.id.clone(),
                expected: TxState::InProgress,
                actual: tx.state,
            });
        }

        let attempts = inner
            .attempts
            .entry(attempt.transaction_id.clone())
            .or_default();
        check_monotonic(attempts, &attempt)?;
        attempts.push(attempt);
        Ok(())
    }

    async fn mark_broadcast(
        &self,
        transaction_id: &str,
        attempt_id: &str,
        now: u64,
    ) -> Result<Transaction, TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        expect_state(inner.tx(transaction_id)?, TxState::InProgress)?;
        inner.attempt_mut(transaction_id, attempt_id)?.state = AttemptState::Broadcast;

        let tx = inner.tx_mut(transaction_id)?;
        tx.state = TxState::Unconfirmed;
        tx.broadcast_at = Some(now);
        tx.initial_broadcast_at.get_or_insert(now);
        let tx = tx.clone();

        if inner.in_progress.get(&tx.from) == Some(&tx.id) {
            inner.in_progress.remove(&tx.from);
        }
        Ok(tx)
    }

    async fn mark_insufficient_funds(
        &self,
        transaction_id: &str,
        attempt_id: &str,
    ) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        expect_state(inner.tx(transaction_id)?, TxState::InProgress)?;
        inner.attempt_mut(transaction_id, attempt_id)?.state = AttemptState::InsufficientFunds;
        Ok(())
    }

    async fn mark_fatal(
        &self,
        transaction_id: &str,
        error: &str,
        release: NonceRelease,
        now: u64,
    ) -> Result<Transaction, TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let (from, nonce, state) = {
            let tx = inner.tx(transaction_id)?;
            (tx.from, tx.nonce, tx.state)
        };
        if !state.can_transition_to(TxState::FatalError) {
            return Err(TransactionStoreError::UnexpectedState {
                transaction_id: transaction_id.to_string(),
                expected: TxState::InProgress,
                actual: state,
            });
        }

        let counter = released_counter(inner.last_nonce.get(&from).copied(), nonce, release);
        match counter {
            Some(Some(value)) => {
                inner.last_nonce.insert(from, value);
            }
            Some(None) => {
                inner.last_nonce.remove(&from);
            }
            None => {}
        }
        if inner.in_progress.get(&from).map(String::as_str) == Some(transaction_id) {
            inner.in_progress.remove(&from);
        }

        let tx = inner.tx_mut(transaction_id)?;
        tx.state = TxState::FatalError;
        tx.error = Some(error.to_string());
        tx.terminal_at = Some(now);
        if release != NonceRelease::Keep {
            tx.nonce = None;
        }
        Ok(tx.clone())
    }

    async fn unconfirmed_with_attempts(
        &self,
    ) -> Result<Vec<(Transaction, Vec<Attempt>)>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        let mut result: Vec<(Transaction, Vec<Attempt>)> = inner
            .transactions
            .values()
            .filter(|tx| {
                matches!(
                    tx.state,
                    TxState::Unconfirmed | TxState::ConfirmedMissingReceipt
                )
            })
            .map(|tx| {
                (
                    tx.clone(),
                    inner.attempts.get(&tx.id).cloned().unwrap_or_default(),
                )
            })
            .collect();
        result.sort_by_key(|(tx, _)| tx.broadcast_at);
        Ok(result)
    }

    async fn confirmed_since(
        &self,
        min_block: u64,
    ) -> Result<Vec<Transaction>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        let mut result: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|tx| tx.state == TxState::Confirmed)
            .filter(|tx| {
                tx.confirmation
                    .as_ref()
                    .is_some_and(|c| c.block_number >= min_block)
            })
            .cloned()
            .collect();
        result.sort_by_key(|tx| tx.confirmation.as_ref().map(|c| c.block_number));
        Ok(result)
    }

    async fn mark_confirmed(
        &self,
        transaction_id: &str,
        expected: TxState,
        confirmation: Confirmation,
    ) -> Result<Transaction, TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let tx = inner.tx_mut(transaction_id)?;
        expect_state(tx, expected)?;
        if !expected.can_transition_to(TxState::Confirmed) {
            return Err(TransactionStoreError::UnexpectedState {
                transaction_id: transaction_id.to_string(),
                expected: TxState::Unconfirmed,
                actual: expected,
            });
        }

        tx.state = TxState::Confirmed;
        tx.terminal_at = Some(confirmation.confirmed_at);
        tx.confirmation = Some(confirmation);
        Ok(tx.clone())
    }

    async fn mark_reorged(
        &self,
        transaction_id: &str,
        expected_block_hash: B256,
    ) -> Result<Transaction, TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let tx = inner.tx_mut(transaction_id)?;
        expect_state(tx, TxState::Confirmed)?;
        if tx.confirmation.as_ref().map(|c| c.block_hash) != Some(expected_block_hash) {
            return Err(TransactionStoreError::UnexpectedState {
                transaction_id: transaction_id.to_string(),
                expected: TxState::Confirmed,
                actual: tx.state,
            });
        }

        tx.state = TxState::Unconfirmed;
        tx.confirmation = None;
        tx.terminal_at = None;
        Ok(tx.clone())
    }

    async fn mark_missing_receipt(&self, transaction_id: &str) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let tx = inner.tx_mut(transaction_id)?;
        expect_state(tx, TxState::Unconfirmed)?;
        tx.state = TxState::ConfirmedMissingReceipt;
        Ok(())
    }

    async fn stale_unconfirmed(
        &self,
        older_than: u64,
        limit: usize,
    ) -> Result<Vec<(Transaction, Attempt)>, TransactionStoreError> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<&Transaction> = inner
            .transactions
            .values()
            .filter(|tx| tx.state == TxState::Unconfirmed)
            .filter(|tx| tx.broadcast_at.is_some_and(|at| at <= older_than))
            .collect();
        stale.sort_by_key(|tx| tx.broadcast_at);

        Ok(stale
            .into_iter()
            .filter_map(|tx| {
                let attempts = inner.attempts.get(&tx.id)?;
                best_attempt(attempts).map(|a| (tx.clone(), a.clone()))
            })
            .take(limit)
            .collect())
    }

    async fn touch_broadcast_at(
        &self,
        transaction_ids: &[String],
        now: u64,
    ) -> Result<(), TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        for id in transaction_ids {
            if let Some(tx) = inner.transactions.get_mut(id) {
                if tx.state == TxState::Unconfirmed {
                    tx.broadcast_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn reap(&self, older_than: u64) -> Result<u64, TransactionStoreError> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<String> = inner
            .transactions
            .values()
            .filter(|tx| tx.state.is_terminal())
            .filter(|tx| tx.terminal_at.is_some_and(|at| at <= older_than))
            .map(|tx| tx.id.clone())
            .collect();

        for id in &expired {
            inner.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .transactions
            .get(transaction_id)
            .cloned())
    }

    async fn attempts_for(&self, transaction_id: &str) -> Result<Vec<Attempt>, TransactionStoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .attempts
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }
}
