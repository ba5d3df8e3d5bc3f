use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::txm::types::{Attempt, Confirmation, Transaction, TxState};

mod atomic;
pub mod memory;
pub mod redis;

pub use memory::MemoryTxStore;
pub use redis::RedisTxStore;

/// Result of an atomic count-then-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Transaction),
    /// A transaction with the same `(from, idempotency_key)` already exists.
    Existing(Transaction),
    QueueFull { count: u64, limit: u64 },
}

/// What happens to the address nonce counter when a transaction fails fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonceRelease {
    /// The nonce may have reached a mempool. Keep it consumed.
    Keep,
    /// Hand the nonce to the next transaction.
    Rollback,
    /// Forget the counter so the next assignment resyncs from the chain.
    Resync,
}

#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "errorCode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStoreError {
    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Serialization error: {message}")]
    DeserError { message: String },

    #[error("Transaction not found: {transaction_id}")]
    TransactionNotFound { transaction_id: String },

    #[error("Attempt {attempt_id} not found for transaction {transaction_id}")]
    AttemptNotFound {
        transaction_id: String,
        attempt_id: String,
    },

    #[error("Transaction {transaction_id} is {actual}, expected {expected}")]
    UnexpectedState {
        transaction_id: String,
        expected: TxState,
        actual: TxState,
    },

    #[error("Lost address lock: {from}:{chain_id} worker: {worker_id}")]
    LockLost {
        from: Address,
        chain_id: u64,
        worker_id: String,
    },

    #[error("Address {from} already has transaction {transaction_id} in progress")]
    InProgressSlotOccupied {
        from: Address,
        transaction_id: String,
    },

    #[error(
        "Attempt gas price {gas_price} for transaction {transaction_id} must exceed {highest}"
    )]
    NonMonotonicGasPrice {
        transaction_id: String,
        gas_price: u128,
        highest: u128,
    },

    #[error("No nonce known for {from}:{chain_id} - chain sync required")]
    NonceSyncRequired { from: Address, chain_id: u64 },

    #[error("Internal error - worker should quit: {message}")]
    InternalError { message: String },
}

impl TransactionStoreError {
    /// The stored data itself is broken. Continuing would risk nonce reuse.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TransactionStoreError::DeserError { .. } | TransactionStoreError::InternalError { .. }
        )
    }
}

impl From<::redis::RedisError> for TransactionStoreError {
    fn from(error: ::redis::RedisError) -> Self {
        TransactionStoreError::RedisError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransactionStoreError {
    fn from(error: serde_json::Error) -> Self {
        TransactionStoreError::DeserError {
            message: error.to_string(),
        }
    }
}

/// Durable record of transactions and their attempts.
///
/// Every mutating operation is one atomic read-modify-write guarded by the
/// expected prior state of the records it touches. Timestamps are unix
/// milliseconds supplied by the caller.
pub trait TxStore: Send + Sync + 'static {
    fn find_by_idempotency_key(
        &self,
        from: Address,
        key: &str,
    ) -> impl Future<Output = Result<Option<Transaction>, TransactionStoreError>> + Send;

    /// Idempotency lookup, capacity check and insert as one unit.
    /// `limit == 0` disables the capacity check.
    fn create_transaction(
        &self,
        tx: Transaction,
        limit: u64,
    ) -> impl Future<Output = Result<CreateOutcome, TransactionStoreError>> + Send;

    /// Delete the oldest unstarted transactions of `(from, subject)` until at
    /// most `keep` remain. Returns how many were deleted.
    fn prune_unstarted(
        &self,
        from: Address,
        subject: &str,
        keep: u64,
    ) -> impl Future<Output = Result<u64, TransactionStoreError>> + Send;

    fn count_non_terminal(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<u64, TransactionStoreError>> + Send;

    /// Oldest unstarted transaction for the address, in creation order.
    fn next_unstarted(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Option<Transaction>, TransactionStoreError>> + Send;

    fn in_progress_for(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Option<Transaction>, TransactionStoreError>> + Send;

    /// Highest nonce handed out for the address, if the store knows one.
    fn last_nonce(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<Option<u64>, TransactionStoreError>> + Send;

    /// Take the address lock, forcefully taking over from a stalled worker.
    fn acquire_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    /// Release the lock if `worker_id` still owns it.
    fn release_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    /// Nonce assignment: validates lock ownership and the empty in-progress
    /// slot, assigns `last_nonce + 1` (or `chain_next_nonce` when the store has
    /// no counter) and persists the transaction as `in_progress`.
    fn start_transaction(
        &self,
        transaction_id: &str,
        from: Address,
        worker_id: &str,
        chain_next_nonce: Option<u64>,
    ) -> impl Future<Output = Result<Transaction, TransactionStoreError>> + Send;

    /// Persist a new attempt. Its gas price must exceed every earlier attempt's.
    fn insert_attempt(
        &self,
        attempt: Attempt,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    /// `in_progress -> unconfirmed` with the attempt marked broadcast.
    fn mark_broadcast(
        &self,
        transaction_id: &str,
        attempt_id: &str,
        now: u64,
    ) -> impl Future<Output = Result<Transaction, TransactionStoreError>> + Send;

    fn mark_insufficient_funds(
        &self,
        transaction_id: &str,
        attempt_id: &str,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    fn mark_fatal(
        &self,
        transaction_id: &str,
        error: &str,
        release: NonceRelease,
        now: u64,
    ) -> impl Future<Output = Result<Transaction, TransactionStoreError>> + Send;

    /// Every `unconfirmed` and `confirmed_missing_receipt` transaction with its attempts.
    fn unconfirmed_with_attempts(
        &self,
    ) -> impl Future<Output = Result<Vec<(Transaction, Vec<Attempt>)>, TransactionStoreError>> + Send;

    /// Confirmed transactions whose confirmation block is at or above `min_block`.
    fn confirmed_since(
        &self,
        min_block: u64,
    ) -> impl Future<Output = Result<Vec<Transaction>, TransactionStoreError>> + Send;

    fn mark_confirmed(
        &self,
        transaction_id: &str,
        expected: TxState,
        confirmation: Confirmation,
    ) -> impl Future<Output = Result<Transaction, TransactionStoreError>> + Send;

    /// `confirmed -> unconfirmed`, only if still confirmed in `expected_block_hash`.
    fn mark_reorged(
        &self,
        transaction_id: &str,
        expected_block_hash: B256,
    ) -> impl Future<Output = Result<Transaction, TransactionStoreError>> + Send;

    fn mark_missing_receipt(
        &self,
        transaction_id: &str,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    /// Unconfirmed transactions with `broadcast_at <= older_than`, oldest first,
    /// each paired with its best attempt.
    fn stale_unconfirmed(
        &self,
        older_than: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(Transaction, Attempt)>, TransactionStoreError>> + Send;

    /// Set `broadcast_at` on every listed transaction that is still unconfirmed.
    fn touch_broadcast_at(
        &self,
        transaction_ids: &[String],
        now: u64,
    ) -> impl Future<Output = Result<(), TransactionStoreError>> + Send;

    /// Delete terminal transactions (and their attempts) that became terminal
    /// at or before `older_than`. Returns how many were deleted.
    fn reap(
        &self,
        older_than: u64,
    ) -> impl Future<Output = Result<u64, TransactionStoreError>> + Send;

    fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> impl Future<Output = Result<Option<Transaction>, TransactionStoreError>> + Send;

    /// Attempts in creation order.
    fn attempts_for(
        &self,
        transaction_id: &str,
    ) -> impl Future<Output = Result<Vec<Attempt>, TransactionStoreError>> + Send;
}

pub(crate) fn expect_state(
    tx: &Transaction,
    expected: TxState,
) -> Result<(), TransactionStoreError> {
    if tx.state != expected {
        return Err(TransactionStoreError::UnexpectedState {
            transaction_id: tx.id.clone(),
            expected,
            actual: tx.state,
        });
    }
    Ok(())
}

/// Highest gas price among `attempts`, checked against a new one.
pub(crate) fn check_monotonic(
    attempts: &[Attempt],
    new: &Attempt,
) -> Result<(), TransactionStoreError> {
    if let Some(highest) = attempts.iter().map(|a| a.gas_price).max() {
        if new.gas_price <= highest {
            return Err(TransactionStoreError::NonMonotonicGasPrice {
                transaction_id: new.transaction_id.clone(),
                gas_price: new.gas_price,
                highest,
            });
        }
    }
    Ok(())
}

/// Counter value after a fatal failure of the transaction holding `nonce`.
/// `None` means the counter is cleared.
pub(crate) fn released_counter(
    current: Option<u64>,
    nonce: Option<u64>,
    release: NonceRelease,
) -> Option<Option<u64>> {
    match (release, nonce) {
        (NonceRelease::Keep, _) | (_, None) => None,
        (NonceRelease::Resync, Some(_)) => Some(None),
        // only roll back when the failed transaction holds the highest nonce
        (NonceRelease::Rollback, Some(nonce)) if current == Some(nonce) => {
            Some(nonce.checked_sub(1))
        }
        (NonceRelease::Rollback, Some(_)) => None,
    }
}
