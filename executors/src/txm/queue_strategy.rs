use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::txm::store::{TransactionStoreError, TxStore};

/// Runs before a new transaction is admitted and may make room for it.
pub trait QueueStrategy: Send + Sync {
    /// Returns how many unstarted transactions were pruned.
    fn before_insert<S: TxStore>(
        &self,
        store: &S,
        from: Address,
    ) -> impl Future<Output = Result<u64, TransactionStoreError>> + Send;
}

/// Keeps every transaction; the capacity check alone decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendEveryStrategy;

impl QueueStrategy for SendEveryStrategy {
    async fn before_insert<S: TxStore>(
        &self,
        _store: &S,
        _from: Address,
    ) -> Result<u64, TransactionStoreError> {
        Ok(0)
    }
}

/// Only the newest `queue_size` transactions of a subject are worth sending.
/// Older ones that have not started are dropped to make room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropOldestStrategy {
    pub subject: String,
    pub queue_size: u64,
}

impl DropOldestStrategy {
    pub fn new(subject: impl Into<String>, queue_size: u64) -> Self {
        Self {
            subject: subject.into(),
            queue_size,
        }
    }
}

impl QueueStrategy for DropOldestStrategy {
    async fn before_insert<S: TxStore>(
        &self,
        store: &S,
        from: Address,
    ) -> Result<u64, TransactionStoreError> {
        // leave room for the transaction about to be inserted
        let keep = self.queue_size.saturating_sub(1);
        let pruned = store.prune_unstarted(from, &self.subject, keep).await?;
        if pruned > 0 {
            tracing::info!(
                from = %from,
                subject = %self.subject,
                pruned = pruned,
                "Dropped oldest unstarted transactions"
            );
        }
        Ok(pruned)
    }
}

/// Serializable strategy choice, as accepted by the admission API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueueStrategyKind {
    #[default]
    SendEvery,
    #[serde(rename_all = "camelCase")]
    DropOldest { subject: String, queue_size: u64 },
}

impl QueueStrategy for QueueStrategyKind {
    async fn before_insert<S: TxStore>(
        &self,
        store: &S,
        from: Address,
    ) -> Result<u64, TransactionStoreError> {
        match self {
            QueueStrategyKind::SendEvery => SendEveryStrategy.before_insert(store, from).await,
            QueueStrategyKind::DropOldest {
                subject,
                queue_size,
            } => {
                DropOldestStrategy::new(subject.clone(), *queue_size)
                    .before_insert(store, from)
                    .await
            }
        }
    }
}
