#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::primitives::{Address, B256, Bytes, U256, address, keccak256};
use tokio::sync::{oneshot, watch};
use txm_core::{
    chain::ChainRpc,
    error::{ChainError, SignerError},
    gas::FixedGasEstimator,
    signer::{KeySet, TxSigner},
    transaction::{Head, Receipt, SignedTransaction, UnsignedTransaction},
};
use txm_executors::txm::{
    Attempt, AttemptState, Confirmation, CreateOutcome, MemoryTxStore, NewTransaction,
    NonceRelease, Transaction, TransactionStoreError, TxManager, TxState, TxStore, TxmConfig,
    TxmError, now_ms,
};

pub const CHAIN_ID: u64 = 31337;
pub const FROM_A: Address = address!("0x00000000000000000000000000000000000000a1");
pub const FROM_B: Address = address!("0x00000000000000000000000000000000000000b2");
pub const TO: Address = address!("0x00000000000000000000000000000000000000c3");
pub const GAS_PRICE: u128 = 1_000_000_000;

pub const INSUFFICIENT_FUNDS: &str = "insufficient funds for gas * price + value";
pub const NONCE_TOO_LOW: &str = "nonce too low";
pub const INVALID_SENDER: &str = "invalid sender";

pub fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txm_executors=debug,txm_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub fn node_error(message: &str) -> ChainError {
    ChainError::error_resp(CHAIN_ID, -32000, message)
}

pub fn transport_error() -> ChainError {
    ChainError::transport(CHAIN_ID, "connection reset by peer")
}

/// Raw bytes produced by [`MockSigner`]: `from|nonce|gas_price|chain_id`.
pub fn decode_raw(raw: &Bytes) -> (Address, u64, u128) {
    let text = String::from_utf8(raw.to_vec()).unwrap();
    let mut parts = text.split('|');
    let from = Address::from_str(parts.next().unwrap()).unwrap();
    let nonce = parts.next().unwrap().parse().unwrap();
    let gas_price = parts.next().unwrap().parse().unwrap();
    (from, nonce, gas_price)
}

/// Deterministic signer: the raw transaction spells out sender, nonce and price.
#[derive(Default)]
pub struct MockSigner;

impl MockSigner {
    pub fn sign_sync(&self, from: Address, tx: &UnsignedTransaction) -> SignedTransaction {
        let raw = Bytes::from(
            format!("{from}|{}|{}|{}", tx.nonce, tx.gas_price, tx.chain_id).into_bytes(),
        );
        SignedTransaction {
            hash: keccak256(&raw),
            raw,
        }
    }
}

impl TxSigner for MockSigner {
    async fn sign(
        &self,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction, SignerError> {
        Ok(self.sign_sync(from, tx))
    }
}

pub struct MockKeySet {
    addresses: watch::Sender<Vec<Address>>,
}

impl MockKeySet {
    pub fn new(addresses: &[Address]) -> Self {
        let (addresses, _) = watch::channel(addresses.to_vec());
        Self { addresses }
    }

    pub fn set(&self, addresses: &[Address]) {
        self.addresses.send_replace(addresses.to_vec());
    }
}

impl KeySet for MockKeySet {
    fn addresses(&self) -> Vec<Address> {
        self.addresses.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Address>> {
        self.addresses.subscribe()
    }
}

#[derive(Default)]
struct MockChainState {
    submitted: Vec<Bytes>,
    batches: Vec<Vec<Bytes>>,
    next_errors: VecDeque<ChainError>,
    errors_from: HashMap<Address, ChainError>,
    errors_raw: HashMap<Bytes, ChainError>,
    receipts: HashMap<B256, Receipt>,
    pending_nonces: HashMap<Address, u64>,
    head: Option<Head>,
}

/// Scripted [`ChainRpc`]. Submissions succeed unless an error was queued for
/// them; receipts exist only once a hash was mined.
pub struct MockChain {
    chain_id: u64,
    state: Mutex<MockChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            chain_id: CHAIN_ID,
            state: Mutex::new(MockChainState::default()),
        }
    }

    pub fn set_pending_nonce(&self, from: Address, nonce: u64) {
        self.state.lock().unwrap().pending_nonces.insert(from, nonce);
    }

    /// The next submission (of any raw transaction) fails with `error`.
    pub fn fail_next_submit(&self, error: ChainError) {
        self.state.lock().unwrap().next_errors.push_back(error);
    }

    /// Every submission from `from` fails with `error` until cleared.
    pub fn fail_submits_from(&self, from: Address, error: ChainError) {
        self.state.lock().unwrap().errors_from.insert(from, error);
    }

    pub fn clear_failures_from(&self, from: Address) {
        self.state.lock().unwrap().errors_from.remove(&from);
    }

    /// Submissions of exactly these bytes fail with `error`.
    pub fn fail_raw(&self, raw: Bytes, error: ChainError) {
        self.state.lock().unwrap().errors_raw.insert(raw, error);
    }

    pub fn submitted(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn submitted_from(&self, from: Address) -> Vec<Bytes> {
        self.submitted()
            .into_iter()
            .filter(|raw| decode_raw(raw).0 == from)
            .collect()
    }

    pub fn batches(&self) -> Vec<Vec<Bytes>> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn mine(&self, hash: B256, block_number: u64, block_hash: B256) {
        self.state.lock().unwrap().receipts.insert(
            hash,
            Receipt {
                status: true,
                tx_hash: hash,
                block_hash,
                block_number,
                gas_used: 21_000,
                logs: Vec::new(),
            },
        );
    }

    pub fn unmine(&self, hash: B256) {
        self.state.lock().unwrap().receipts.remove(&hash);
    }

    pub fn set_head(&self, number: u64) -> Head {
        let head = Head {
            number,
            hash: block_hash(number),
        };
        self.state.lock().unwrap().head = Some(head);
        head
    }

    /// Head at `number` on a named fork.
    pub fn set_fork_head(&self, number: u64, fork: &str) -> Head {
        let head = Head {
            number,
            hash: fork_block_hash(number, fork),
        };
        self.state.lock().unwrap().head = Some(head);
        head
    }

    fn submit(&self, raw: &Bytes) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(raw.clone());

        if let Some(error) = state.next_errors.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.errors_raw.get(raw) {
            return Err(error.clone());
        }
        let (from, _, _) = decode_raw(raw);
        if let Some(error) = state.errors_from.get(&from) {
            return Err(error.clone());
        }
        Ok(())
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainRpc for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn submit_raw(&self, raw: &Bytes) -> Result<(), ChainError> {
        self.submit(raw)
    }

    async fn batch_submit_raw(&self, raws: &[Bytes]) -> Vec<Result<(), ChainError>> {
        self.state.lock().unwrap().batches.push(raws.to_vec());
        raws.iter().map(|raw| self.submit(raw)).collect()
    }

    async fn get_receipts(&self, hashes: &[B256]) -> Vec<Result<Option<Receipt>, ChainError>> {
        let state = self.state.lock().unwrap();
        hashes
            .iter()
            .map(|hash| Ok(state.receipts.get(hash).cloned()))
            .collect()
    }

    async fn pending_nonce_at(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending_nonces
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn latest_head(&self) -> Result<Head, ChainError> {
        self.state
            .lock()
            .unwrap()
            .head
            .ok_or_else(transport_error)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(GAS_PRICE)
    }
}

/// Distinct, deterministic block hash per height.
pub fn block_hash(number: u64) -> B256 {
    keccak256(format!("block-{number}"))
}

pub fn fork_block_hash(number: u64, fork: &str) -> B256 {
    keccak256(format!("block-{number}-{fork}"))
}

pub type TestManager<S = MemoryTxStore> =
    TxManager<MockChain, MockSigner, MockKeySet, S, FixedGasEstimator>;

pub struct Harness<S = MemoryTxStore> {
    pub chain: Arc<MockChain>,
    pub signer: Arc<MockSigner>,
    pub keys: Arc<MockKeySet>,
    pub store: Arc<S>,
    pub manager: TestManager<S>,
}

/// Fast intervals, a single retry and no queue limit.
pub fn test_config() -> TxmConfig {
    TxmConfig {
        queue_depth_limit: 0,
        send_retry_attempts: 2,
        send_retry_backoff_ms: 1,
        broadcaster_poll_interval_ms: 50,
        head_poll_interval_ms: 20,
        resend_interval_ms: 60_000,
        reap_interval_ms: 60_000,
        rpc_timeout_ms: 1_000,
        ..Default::default()
    }
}

pub fn harness(config: TxmConfig, addresses: &[Address]) -> Harness {
    harness_with_store(config, addresses, Arc::new(MemoryTxStore::new(CHAIN_ID)))
}

pub fn harness_with_store<S: TxStore>(
    config: TxmConfig,
    addresses: &[Address],
    store: Arc<S>,
) -> Harness<S> {
    setup_tracing();
    let chain = Arc::new(MockChain::new());
    let signer = Arc::new(MockSigner);
    let keys = Arc::new(MockKeySet::new(addresses));
    let manager = TxManager::new(
        chain.clone(),
        signer.clone(),
        keys.clone(),
        store.clone(),
        Arc::new(FixedGasEstimator::new(GAS_PRICE)),
        config,
    )
    .unwrap();

    Harness {
        chain,
        signer,
        keys,
        store,
        manager,
    }
}

pub fn new_tx(from: Address) -> NewTransaction {
    NewTransaction {
        from,
        to: TO,
        value: U256::from(1u64),
        data: Bytes::new(),
        gas_limit: 21_000,
        ..Default::default()
    }
}

impl<S: TxStore> Harness<S> {
    /// One broadcaster pass for `from`, the way a running worker does it.
    pub async fn drain(&self, from: Address) -> Result<bool, TxmError> {
        let broadcaster = self.manager.broadcaster(from);
        self.store
            .acquire_address_lock(from, broadcaster.worker_id())
            .await?;
        let (_shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let result = broadcaster.process_queue(&mut shutdown_rx).await;
        self.store
            .release_address_lock(from, broadcaster.worker_id())
            .await?;
        result
    }

    pub async fn tx(&self, id: &str) -> Transaction {
        self.store.get_transaction(id).await.unwrap().unwrap()
    }

    pub async fn attempts(&self, id: &str) -> Vec<Attempt> {
        self.store.attempts_for(id).await.unwrap()
    }

    /// Put a transaction straight into `unconfirmed` with one attempt per
    /// gas price, bypassing the broadcaster.
    pub async fn seed_unconfirmed(
        &self,
        from: Address,
        gas_prices: &[u128],
        broadcast_at: u64,
    ) -> (Transaction, Vec<Attempt>) {
        let tx = new_tx(from).into_transaction(CHAIN_ID, broadcast_at);
        let id = tx.id.clone();
        self.store.create_transaction(tx, 0).await.unwrap();

        self.store.acquire_address_lock(from, "seed").await.unwrap();
        let tx = self
            .store
            .start_transaction(&id, from, "seed", Some(0))
            .await
            .unwrap();

        let mut last_attempt_id = String::new();
        for (i, gas_price) in gas_prices.iter().enumerate() {
            let signed = self.signer.sign_sync(
                from,
                &UnsignedTransaction {
                    chain_id: CHAIN_ID,
                    nonce: tx.nonce.unwrap(),
                    to: tx.to,
                    value: tx.value,
                    input: tx.data.clone(),
                    gas_limit: tx.gas_limit,
                    gas_price: *gas_price,
                },
            );
            let attempt = Attempt {
                id: format!("{id}-{i}"),
                transaction_id: id.clone(),
                gas_price: *gas_price,
                hash: signed.hash,
                signed_raw_transaction: signed.raw,
                state: AttemptState::Broadcast,
                created_at: broadcast_at + i as u64,
            };
            last_attempt_id = attempt.id.clone();
            self.store.insert_attempt(attempt).await.unwrap();
        }

        self.store
            .mark_broadcast(&id, &last_attempt_id, broadcast_at)
            .await
            .unwrap();
        self.store.release_address_lock(from, "seed").await.unwrap();

        (self.tx(&id).await, self.attempts(&id).await)
    }
}

/// [`MemoryTxStore`] whose `acquire_address_lock` fails a set number of times
/// with a backend error before succeeding again.
pub struct FlakyLockStore {
    pub inner: MemoryTxStore,
    lock_failures: AtomicUsize,
}

impl FlakyLockStore {
    pub fn new(lock_failures: usize) -> Self {
        Self {
            inner: MemoryTxStore::new(CHAIN_ID),
            lock_failures: AtomicUsize::new(lock_failures),
        }
    }

    pub fn remaining_lock_failures(&self) -> usize {
        self.lock_failures.load(Ordering::SeqCst)
    }
}

impl TxStore for FlakyLockStore {
    async fn find_by_idempotency_key(
        &self,
        from: Address,
        key: &str,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        self.inner.find_by_idempotency_key(from, key).await
    }

    async fn create_transaction(
        &self,
        tx: Transaction,
        limit: u64,
    ) -> Result<CreateOutcome, TransactionStoreError> {
        self.inner.create_transaction(tx, limit).await
    }

    async fn prune_unstarted(
        &self,
        from: Address,
        subject: &str,
        keep: u64,
    ) -> Result<u64, TransactionStoreError> {
        self.inner.prune_unstarted(from, subject, keep).await
    }

    async fn count_non_terminal(&self, from: Address) -> Result<u64, TransactionStoreError> {
        self.inner.count_non_terminal(from).await
    }

    async fn next_unstarted(
        &self,
        from: Address,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        self.inner.next_unstarted(from).await
    }

    async fn in_progress_for(
        &self,
        from: Address,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        self.inner.in_progress_for(from).await
    }

    async fn last_nonce(&self, from: Address) -> Result<Option<u64>, TransactionStoreError> {
        self.inner.last_nonce(from).await
    }

    async fn acquire_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> Result<(), TransactionStoreError> {
        let failed = self
            .lock_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransactionStoreError::RedisError {
                message: "connection reset by peer".into(),
            });
        }
        self.inner.acquire_address_lock(from, worker_id).await
    }

    async fn release_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> Result<(), TransactionStoreError> {
        self.inner.release_address_lock(from, worker_id).await
    }

    async fn start_transaction(
        &self,
        transaction_id: &str,
        from: Address,
        worker_id: &str,
        chain_next_nonce: Option<u64>,
    ) -> Result<Transaction, TransactionStoreError> {
        self.inner
            .start_transaction(transaction_id, from, worker_id, chain_next_nonce)
            .await
    }

    async fn insert_attempt(&self, attempt: Attempt) -> Result<(), TransactionStoreError> {
        self.inner.insert_attempt(attempt).await
    }

    async fn mark_broadcast(
        &self,
        transaction_id: &str,
        attempt_id: &str,
        now: u64,
    ) -> Result<Transaction, TransactionStoreError> {
        self.inner.mark_broadcast(transaction_id, attempt_id, now).await
    }

    async fn mark_insufficient_funds(
        &self,
        transaction_id: &str,
        attempt_id: &str,
    ) -> Result<(), TransactionStoreError> {
        self.inner
            .mark_insufficient_funds(transaction_id, attempt_id)
            .await
    }

    async fn mark_fatal(
        &self,
        transaction_id: &str,
        error: &str,
        release: NonceRelease,
        now: u64,
    ) -> Result<Transaction, TransactionStoreError> {
        self.inner
            .mark_fatal(transaction_id, error, release, now)
            .await
    }

    async fn unconfirmed_with_attempts(
        &self,
    ) -> Result<Vec<(Transaction, Vec<Attempt>)>, TransactionStoreError> {
        self.inner.unconfirmed_with_attempts().await
    }

    async fn confirmed_since(
        &self,
        min_block: u64,
    ) -> Result<Vec<Transaction>, TransactionStoreError> {
        self.inner.confirmed_since(min_block).await
    }

    async fn mark_confirmed(
        &self,
        transaction_id: &str,
        expected: TxState,
        confirmation: Confirmation,
    ) -> Result<Transaction, TransactionStoreError> {
        self.inner
            .mark_confirmed(transaction_id, expected, confirmation)
            .await
    }

    async fn mark_reorged(
        &self,
        transaction_id: &str,
        expected_block_hash: B256,
    ) -> Result<Transaction, TransactionStoreError> {
        self.inner
            .mark_reorged(transaction_id, expected_block_hash)
            .await
    }

    async fn mark_missing_receipt(&self, transaction_id: &str) -> Result<(), TransactionStoreError> {
        self.inner.mark_missing_receipt(transaction_id).await
    }

    async fn stale_unconfirmed(
        &self,
        older_than: u64,
        limit: usize,
    ) -> Result<Vec<(Transaction, Attempt)>, TransactionStoreError> {
        self.inner.stale_unconfirmed(older_than, limit).await
    }

    async fn touch_broadcast_at(
        &self,
        transaction_ids: &[String],
        now: u64,
    ) -> Result<(), TransactionStoreError> {
        self.inner.touch_broadcast_at(transaction_ids, now).await
    }

    async fn reap(&self, older_than: u64) -> Result<u64, TransactionStoreError> {
        self.inner.reap(older_than).await
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        self.inner.get_transaction(transaction_id).await
    }

    async fn attempts_for(&self, transaction_id: &str) -> Result<Vec<Attempt>, TransactionStoreError> {
        self.inner.attempts_for(transaction_id).await
    }
}

/// Milliseconds in the past.
pub fn ago(ms: u64) -> u64 {
    now_ms().saturating_sub(ms)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
