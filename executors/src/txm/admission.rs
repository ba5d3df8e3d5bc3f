use std::{collections::HashMap, sync::Arc};

use alloy::primitives::Address;
use tokio::sync::{
    RwLock,
    mpsc::{self, error::TrySendError},
};

use crate::txm::{
    error::AdmissionError,
    queue_strategy::QueueStrategy,
    store::{CreateOutcome, TxStore},
    types::{NewTransaction, Transaction, now_ms},
};

/// Wake channels of the running broadcasters, keyed by sending address.
///
/// Each channel has capacity one: a pending wake already covers any number of
/// new transactions, so a full channel is not an error.
#[derive(Clone, Default)]
pub struct WakeRegistry {
    senders: Arc<RwLock<HashMap<Address, mpsc::Sender<()>>>>,
}

impl WakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `from` and return the receiving end for its broadcaster.
    pub async fn register(&self, from: Address) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.senders.write().await.insert(from, tx);
        rx
    }

    pub async fn unregister(&self, from: Address) {
        self.senders.write().await.remove(&from);
    }

    /// Returns false if no live broadcaster runs for `from`.
    pub async fn wake(&self, from: Address) -> bool {
        match self.senders.read().await.get(&from) {
            // full means a wake is already pending
            Some(sender) => !matches!(sender.try_send(()), Err(TrySendError::Closed(_))),
            None => false,
        }
    }
}

/// Capacity and idempotency checks at transaction creation time.
pub struct AdmissionGate<S> {
    store: Arc<S>,
    chain_id: u64,
    queue_depth_limit: u64,
    wake: WakeRegistry,
}

impl<S: TxStore> AdmissionGate<S> {
    pub fn new(store: Arc<S>, chain_id: u64, queue_depth_limit: u64, wake: WakeRegistry) -> Self {
        Self {
            store,
            chain_id,
            queue_depth_limit,
            wake,
        }
    }

    /// Persist a new `unstarted` transaction, or return the existing one for
    /// the same `(from, idempotency_key)`.
    #[tracing::instrument(skip_all, fields(from = %request.from, idempotency_key = ?request.idempotency_key))]
    pub async fn create_transaction<Q: QueueStrategy>(
        &self,
        request: NewTransaction,
        strategy: &Q,
    ) -> Result<Transaction, AdmissionError> {
        if request.to == Address::ZERO {
            return Err(AdmissionError::ZeroAddress);
        }

        let from = request.from;
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(from, key).await? {
                tracing::debug!(tx_id = %existing.id, "Returning existing transaction for idempotency key");
                return Ok(existing);
            }
        }

        strategy.before_insert(self.store.as_ref(), from).await?;

        let tx = request.into_transaction(self.chain_id, now_ms());
        match self
            .store
            .create_transaction(tx, self.queue_depth_limit)
            .await?
        {
            CreateOutcome::Created(tx) => {
                tracing::info!(tx_id = %tx.id, "Queued transaction");
                self.wake.wake(from).await;
                Ok(tx)
            }
            // lost a race with a concurrent request using the same key
            CreateOutcome::Existing(existing) => Ok(existing),
            CreateOutcome::QueueFull { count, limit } => {
                tracing::warn!(count = count, limit = limit, "Rejected transaction, queue is full");
                Err(AdmissionError::QueueFull { from, count, limit })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txm::{queue_strategy::SendEveryStrategy, store::MemoryTxStore};
    use alloy::primitives::{U256, address};

    const FROM: Address = address!("0x00000000000000000000000000000000000000aa");
    const TO: Address = address!("0x00000000000000000000000000000000000000bb");

    fn request() -> NewTransaction {
        NewTransaction {
            from: FROM,
            to: TO,
            gas_limit: 21_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn zero_address_is_rejected_for_any_value() {
        let gate = AdmissionGate::new(Arc::new(MemoryTxStore::new(1)), 1, 0, WakeRegistry::new());
        for value in [U256::ZERO, U256::from(5u64)] {
            let err = gate
                .create_transaction(
                    NewTransaction {
                        to: Address::ZERO,
                        value,
                        ..request()
                    },
                    &SendEveryStrategy,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, AdmissionError::ZeroAddress));
        }
    }

    #[tokio::test]
    async fn wake_reports_a_dropped_receiver_as_not_running() {
        let wake = WakeRegistry::new();
        let rx = wake.register(FROM).await;
        assert!(wake.wake(FROM).await);
        // pending wake, channel full
        assert!(wake.wake(FROM).await);

        drop(rx);
        assert!(!wake.wake(FROM).await);
    }

    #[tokio::test]
    async fn successful_creation_wakes_the_broadcaster() {
        let wake = WakeRegistry::new();
        let mut rx = wake.register(FROM).await;
        let gate = AdmissionGate::new(Arc::new(MemoryTxStore::new(1)), 1, 0, wake.clone());

        gate.create_transaction(request(), &SendEveryStrategy)
            .await
            .unwrap();
        gate.create_transaction(request(), &SendEveryStrategy)
            .await
            .unwrap();

        assert!(rx.try_recv().is_ok());
        // wakes coalesce
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wake_without_broadcaster_is_a_no_op() {
        let wake = WakeRegistry::new();
        assert!(!wake.wake(FROM).await);
        let _rx = wake.register(FROM).await;
        assert!(wake.wake(FROM).await);
        wake.unregister(FROM).await;
        assert!(!wake.wake(FROM).await);
    }
}
