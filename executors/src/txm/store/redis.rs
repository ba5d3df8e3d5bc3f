use ::redis::{
    AsyncCommands, Client, Pipeline,
    aio::{ConnectionManager, MultiplexedConnection},
};
use alloy::primitives::{Address, B256};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::txm::{
    store::{
        CreateOutcome, NonceRelease, TransactionStoreError, TxStore, atomic::SafeRedisTransaction,
        check_monotonic, expect_state, released_counter,
    },
    types::{Attempt, AttemptState, Confirmation, Transaction, TxState, best_attempt},
};

pub struct RedisTxStoreKeys {
    pub chain_id: u64,
    pub namespace: Option<String>,
}

impl RedisTxStoreKeys {
    pub fn new(chain_id: u64, namespace: Option<String>) -> Self {
        Self {
            chain_id,
            namespace,
        }
    }

    fn prefix(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:txm:{}", self.chain_id),
            None => format!("txm:{}", self.chain_id),
        }
    }

    /// Transaction JSON blob.
    pub fn transaction_key_name(&self, transaction_id: &str) -> String {
        format!("{}:tx:{transaction_id}", self.prefix())
    }

    /// HASH of attempt id to attempt JSON.
    pub fn attempts_hash_name(&self, transaction_id: &str) -> String {
        format!("{}:tx_attempts:{transaction_id}", self.prefix())
    }

    /// ZSET of unstarted transaction ids scored by creation sequence.
    pub fn unstarted_zset_name(&self, from: Address) -> String {
        format!("{}:unstarted:{from}", self.prefix())
    }

    pub fn sequence_key_name(&self) -> String {
        format!("{}:sequence", self.prefix())
    }

    /// Id of the single `in_progress` transaction of the address.
    pub fn in_progress_key_name(&self, from: Address) -> String {
        format!("{}:in_progress:{from}", self.prefix())
    }

    /// SET of ids in queue-consuming states, used for the capacity check.
    pub fn active_set_name(&self, from: Address) -> String {
        format!("{}:active:{from}", self.prefix())
    }

    /// HASH of idempotency key to transaction id.
    pub fn idempotency_hash_name(&self, from: Address) -> String {
        format!("{}:idempotency:{from}", self.prefix())
    }

    pub fn last_nonce_key_name(&self, from: Address) -> String {
        format!("{}:last_nonce:{from}", self.prefix())
    }

    pub fn lock_key_name(&self, from: Address) -> String {
        format!("{}:lock:{from}", self.prefix())
    }

    /// ZSET of unconfirmed ids scored by `broadcast_at`.
    pub fn unconfirmed_zset_name(&self) -> String {
        format!("{}:unconfirmed", self.prefix())
    }

    pub fn missing_receipt_set_name(&self) -> String {
        format!("{}:missing_receipt", self.prefix())
    }

    /// ZSET of confirmed ids scored by confirmation block number.
    pub fn confirmed_zset_name(&self) -> String {
        format!("{}:confirmed", self.prefix())
    }

    /// ZSET of terminal ids scored by `terminal_at`.
    pub fn terminal_zset_name(&self) -> String {
        format!("{}:terminal", self.prefix())
    }
}

/// Durable [`TxStore`] on Redis.
pub struct RedisTxStore {
    pub(super) client: Client,
    pub redis: ConnectionManager,
    pub keys: RedisTxStoreKeys,
    pub(super) watch_connections: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisTxStore {
    pub async fn new(
        client: Client,
        chain_id: u64,
        namespace: Option<String>,
    ) -> Result<Self, TransactionStoreError> {
        let redis = client.get_connection_manager().await?;
        Ok(Self {
            client,
            redis,
            keys: RedisTxStoreKeys::new(chain_id, namespace),
            watch_connections: Mutex::new(Vec::new()),
        })
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<Transaction>, TransactionStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| self.keys.transaction_key_name(id))
            .collect();
        let mut conn = self.redis.clone();
        let raws: Vec<Option<String>> = conn.mget(&keys).await?;

        raws.into_iter()
            .flatten()
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .collect()
    }

    async fn require_tx(&self, transaction_id: &str) -> Result<Transaction, TransactionStoreError> {
        self.get_transaction(transaction_id).await?.ok_or_else(|| {
            TransactionStoreError::TransactionNotFound {
                transaction_id: transaction_id.to_string(),
            }
        })
    }

    async fn with_attempts(
        &self,
        txs: Vec<Transaction>,
    ) -> Result<Vec<(Transaction, Vec<Attempt>)>, TransactionStoreError> {
        let mut result = Vec::with_capacity(txs.len());
        for tx in txs {
            let attempts = self.attempts_for(&tx.id).await?;
            result.push((tx, attempts));
        }
        Ok(result)
    }
}

async fn get_json<T, C>(conn: &mut C, key: &str) -> Result<Option<T>, TransactionStoreError>
where
    T: DeserializeOwned,
    C: AsyncCommands,
{
    let raw: Option<String> = conn.get(key).await?;
    Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
}

async fn require_json<C: AsyncCommands>(
    conn: &mut C,
    key: &str,
    transaction_id: &str,
) -> Result<Transaction, TransactionStoreError> {
    get_json(conn, key)
        .await?
        .ok_or_else(|| TransactionStoreError::TransactionNotFound {
            transaction_id: transaction_id.to_string(),
        })
}

async fn get_attempts<C: AsyncCommands>(
    conn: &mut C,
    key: &str,
) -> Result<Vec<Attempt>, TransactionStoreError> {
    let raws: Vec<String> = conn.hvals(key).await?;
    let mut attempts = raws
        .iter()
        .map(|raw| serde_json::from_str::<Attempt>(raw))
        .collect::<Result<Vec<_>, _>>()?;
    // gas prices strictly increase, so this is creation order
    attempts.sort_by_key(|a| (a.gas_price, a.created_at));
    Ok(attempts)
}

/// Removes every index entry of a deleted transaction.
fn queue_delete(pipeline: &mut Pipeline, keys: &RedisTxStoreKeys, tx: &Transaction) {
    pipeline.del(keys.transaction_key_name(&tx.id));
    pipeline.del(keys.attempts_hash_name(&tx.id));
    pipeline.zrem(keys.unstarted_zset_name(tx.from), &tx.id);
    pipeline.srem(keys.active_set_name(tx.from), &tx.id);
    pipeline.zrem(keys.terminal_zset_name(), &tx.id);
    pipeline.zrem(keys.confirmed_zset_name(), &tx.id);
    if let Some(key) = &tx.idempotency_key {
        pipeline.hdel(keys.idempotency_hash_name(tx.from), key);
    }
}

enum CreateDecision {
    Existing(Transaction),
    Full { count: u64 },
    Insert { sequence: u64, tx_json: String },
}

struct CreateTransaction<'a> {
    keys: &'a RedisTxStoreKeys,
    tx: &'a Transaction,
    limit: u64,
}

impl SafeRedisTransaction for CreateTransaction<'_> {
    type ValidationData = CreateDecision;
    type OperationResult = CreateOutcome;

    fn name(&self) -> &str {
        "create transaction"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![
            self.keys.idempotency_hash_name(self.tx.from),
            self.keys.active_set_name(self.tx.from),
        ]
    }

    async fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<CreateDecision, TransactionStoreError> {
        if let Some(key) = &self.tx.idempotency_key {
            let existing_id: Option<String> = conn
                .hget(self.keys.idempotency_hash_name(self.tx.from), key)
                .await?;
            if let Some(id) = existing_id {
                if let Some(existing) =
                    get_json(conn, &self.keys.transaction_key_name(&id)).await?
                {
                    return Ok(CreateDecision::Existing(existing));
                }
            }
        }

        let count: u64 = conn.scard(self.keys.active_set_name(self.tx.from)).await?;
        if self.limit > 0 && count >= self.limit {
            return Ok(CreateDecision::Full { count });
        }

        let sequence: u64 = conn.incr(self.keys.sequence_key_name(), 1).await?;
        Ok(CreateDecision::Insert {
            sequence,
            tx_json: serde_json::to_string(self.tx)?,
        })
    }

    fn operation(&self, pipeline: &mut Pipeline, decision: CreateDecision) -> CreateOutcome {
        match decision {
            CreateDecision::Existing(tx) => CreateOutcome::Existing(tx),
            CreateDecision::Full { count } => CreateOutcome::QueueFull {
                count,
                limit: self.limit,
            },
            CreateDecision::Insert { sequence, tx_json } => {
                let tx = self.tx;
                pipeline.set(self.keys.transaction_key_name(&tx.id), tx_json);
                pipeline.zadd(self.keys.unstarted_zset_name(tx.from), &tx.id, sequence);
                pipeline.sadd(self.keys.active_set_name(tx.from), &tx.id);
                if let Some(key) = &tx.idempotency_key {
                    pipeline.hset(self.keys.idempotency_hash_name(tx.from), key, &tx.id);
                }
                CreateOutcome::Created(tx.clone())
            }
        }
    }
}

struct PruneUnstarted<'a> {
    keys: &'a RedisTxStoreKeys,
    from: Address,
    subject: &'a str,
    keep: u64,
}

impl SafeRedisTransaction for PruneUnstarted<'_> {
    type ValidationData = Vec<Transaction>;
    type OperationResult = u64;

    fn name(&self) -> &str {
        "prune unstarted"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![self.keys.unstarted_zset_name(self.from)]
    }

    async fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Vec<Transaction>, TransactionStoreError> {
        let ids: Vec<String> = conn
            .zrange(self.keys.unstarted_zset_name(self.from), 0, -1)
            .await?;

        let mut matching = Vec::new();
        for id in ids {
            let tx: Option<Transaction> =
                get_json(conn, &self.keys.transaction_key_name(&id)).await?;
            if let Some(tx) = tx.filter(|tx| tx.subject.as_deref() == Some(self.subject)) {
                matching.push(tx);
            }
        }

        let excess = (matching.len() as u64).saturating_sub(self.keep) as usize;
        matching.truncate(excess);
        Ok(matching)
    }

    fn operation(&self, pipeline: &mut Pipeline, doomed: Vec<Transaction>) -> u64 {
        for tx in &doomed {
            queue_delete(pipeline, self.keys, tx);
        }
        doomed.len() as u64
    }
}

struct ReleaseLock<'a> {
    keys: &'a RedisTxStoreKeys,
    from: Address,
    worker_id: &'a str,
}

impl SafeRedisTransaction for ReleaseLock<'_> {
    type ValidationData = bool;
    type OperationResult = ();

    fn name(&self) -> &str {
        "release address lock"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![self.keys.lock_key_name(self.from)]
    }

    async fn validation(&self, conn: &mut MultiplexedConnection) -> Result<bool, TransactionStoreError> {
        let owner: Option<String> = conn.get(self.keys.lock_key_name(self.from)).await?;
        Ok(owner.as_deref() == Some(self.worker_id))
    }

    fn operation(&self, pipeline: &mut Pipeline, owned: bool) {
        if owned {
            pipeline.del(self.keys.lock_key_name(self.from));
        }
    }
}

struct StartTransaction<'a> {
    keys: &'a RedisTxStoreKeys,
    transaction_id: &'a str,
    from: Address,
    worker_id: &'a str,
    chain_next_nonce: Option<u64>,
}

impl SafeRedisTransaction for StartTransaction<'_> {
    type ValidationData = (Transaction, String);
    type OperationResult = Transaction;

    fn name(&self) -> &str {
        "unstarted->in_progress"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![
            self.keys.lock_key_name(self.from),
            self.keys.in_progress_key_name(self.from),
            self.keys.last_nonce_key_name(self.from),
            self.keys.transaction_key_name(self.transaction_id),
        ]
    }

    async fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<(Transaction, String), TransactionStoreError> {
        let owner: Option<String> = conn.get(self.keys.lock_key_name(self.from)).await?;
        if owner.as_deref() != Some(self.worker_id) {
            return Err(TransactionStoreError::LockLost {
                from: self.from,
                chain_id: self.keys.chain_id,
                worker_id: self.worker_id.to_string(),
            });
        }

        let occupant: Option<String> = conn.get(self.keys.in_progress_key_name(self.from)).await?;
        if let Some(occupant) = occupant {
            return Err(TransactionStoreError::InProgressSlotOccupied {
                from: self.from,
                transaction_id: occupant,
            });
        }

        let mut tx = require_json(
            conn,
            &self.keys.transaction_key_name(self.transaction_id),
            self.transaction_id,
        )
        .await?;
        expect_state(&tx, TxState::Unstarted)?;

        let last_nonce: Option<u64> = conn.get(self.keys.last_nonce_key_name(self.from)).await?;
        let nonce = match (last_nonce, self.chain_next_nonce) {
            (Some(last), _) => last + 1,
            (None, Some(next)) => next,
            (None, None) => {
                return Err(TransactionStoreError::NonceSyncRequired {
                    from: self.from,
                    chain_id: self.keys.chain_id,
                });
            }
        };

        tx.nonce = Some(nonce);
        tx.state = TxState::InProgress;
        let json = serde_json::to_string(&tx)?;
        Ok((tx, json))
    }

    fn operation(&self, pipeline: &mut Pipeline, (tx, json): (Transaction, String)) -> Transaction {
        if let Some(nonce) = tx.nonce {
            pipeline.set(self.keys.last_nonce_key_name(self.from), nonce);
        }
        pipeline.set(self.keys.transaction_key_name(&tx.id), json);
        pipeline.set(self.keys.in_progress_key_name(self.from), &tx.id);
        pipeline.zrem(self.keys.unstarted_zset_name(self.from), &tx.id);
        tx
    }
}

struct InsertAttempt<'a> {
    keys: &'a RedisTxStoreKeys,
    attempt: &'a Attempt,
}

impl SafeRedisTransaction for InsertAttempt<'_> {
    type ValidationData = String;
    type OperationResult = ();

    fn name(&self) -> &str {
        "insert attempt"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![
            self.keys.transaction_key_name(&self.attempt.transaction_id),
            self.keys.attempts_hash_name(&self.attempt.transaction_id),
        ]
    }

    async fn validation(&self, conn: &mut MultiplexedConnection) -> Result<String, TransactionStoreError> {
        let transaction_id = &self.attempt.transaction_id;
        let tx = require_json(conn, &self.keys.transaction_key_name(transaction_id), transaction_id)
            .await?;
        if !matches!(tx.state, TxState::InProgress | TxState::Unconfirmed) {
            return Err(TransactionStoreError::UnexpectedState {
                transaction_id: tx.id,
                expected: TxState::InProgress,
                actual: tx.state,
            });
        }

        let attempts = get_attempts(conn, &self.keys.attempts_hash_name(transaction_id)).await?;
        check_monotonic(&attempts, self.attempt)?;
        Ok(serde_json::to_string(self.attempt)?)
    }

    fn operation(&self, pipeline: &mut Pipeline, json: String) {
        pipeline.hset(
            self.keys.attempts_hash_name(&self.attempt.transaction_id),
            &self.attempt.id,
            json,
        );
    }
}

/// Rewrites one attempt's state, optionally moving the transaction to unconfirmed.
struct UpdateAttempt<'a> {
    keys: &'a RedisTxStoreKeys,
    from: Address,
    transaction_id: &'a str,
    attempt_id: &'a str,
    state: AttemptState,
    /// `Some(now)` moves the transaction to unconfirmed.
    broadcast_at: Option<u64>,
}

struct UpdatedAttempt {
    tx: Transaction,
    tx_json: String,
    attempt_json: String,
    release_slot: bool,
}

impl SafeRedisTransaction for UpdateAttempt<'_> {
    type ValidationData = UpdatedAttempt;
    type OperationResult = Transaction;

    fn name(&self) -> &str {
        match self.broadcast_at {
            Some(_) => "in_progress->unconfirmed",
            None => "update attempt",
        }
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![
            self.keys.transaction_key_name(self.transaction_id),
            self.keys.attempts_hash_name(self.transaction_id),
            self.keys.in_progress_key_name(self.from),
        ]
    }

    async fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<UpdatedAttempt, TransactionStoreError> {
        let mut tx = require_json(
            conn,
            &self.keys.transaction_key_name(self.transaction_id),
            self.transaction_id,
        )
        .await?;
        expect_state(&tx, TxState::InProgress)?;

        let raw: Option<String> = conn
            .hget(self.keys.attempts_hash_name(self.transaction_id), self.attempt_id)
            .await?;
        let mut attempt: Attempt = match raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => {
                return Err(TransactionStoreError::AttemptNotFound {
                    transaction_id: self.transaction_id.to_string(),
                    attempt_id: self.attempt_id.to_string(),
                });
            }
        };
        attempt.state = self.state;

        let mut release_slot = false;
        if let Some(now) = self.broadcast_at {
            tx.state = TxState::Unconfirmed;
            tx.broadcast_at = Some(now);
            tx.initial_broadcast_at.get_or_insert(now);
            let occupant: Option<String> =
                conn.get(self.keys.in_progress_key_name(self.from)).await?;
            release_slot = occupant.as_deref() == Some(self.transaction_id);
        }

        Ok(UpdatedAttempt {
            tx_json: serde_json::to_string(&tx)?,
            attempt_json: serde_json::to_string(&attempt)?,
            tx,
            release_slot,
        })
    }

    fn operation(&self, pipeline: &mut Pipeline, updated: UpdatedAttempt) -> Transaction {
        pipeline.hset(
            self.keys.attempts_hash_name(self.transaction_id),
            self.attempt_id,
            updated.attempt_json,
        );
        if let Some(now) = self.broadcast_at {
            pipeline.set(self.keys.transaction_key_name(self.transaction_id), updated.tx_json);
            pipeline.zadd(self.keys.unconfirmed_zset_name(), self.transaction_id, now);
            if updated.release_slot {
                pipeline.del(self.keys.in_progress_key_name(self.from));
            }
        }
        updated.tx
    }
}

struct MarkFatal<'a> {
    keys: &'a RedisTxStoreKeys,
    from: Address,
    transaction_id: &'a str,
    error: &'a str,
    release: NonceRelease,
    now: u64,
}

struct FatalUpdate {
    tx: Transaction,
    tx_json: String,
    counter: Option<Option<u64>>,
    release_slot: bool,
}

impl SafeRedisTransaction for MarkFatal<'_> {
    type ValidationData = FatalUpdate;
    type OperationResult = Transaction;

    fn name(&self) -> &str {
        "->fatal_error"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![
            self.keys.transaction_key_name(self.transaction_id),
            self.keys.last_nonce_key_name(self.from),
            self.keys.in_progress_key_name(self.from),
        ]
    }

    async fn validation(&self, conn: &mut MultiplexedConnection) -> Result<FatalUpdate, TransactionStoreError> {
        let mut tx = require_json(
            conn,
            &self.keys.transaction_key_name(self.transaction_id),
            self.transaction_id,
        )
        .await?;
        if !tx.state.can_transition_to(TxState::FatalError) {
            return Err(TransactionStoreError::UnexpectedState {
                transaction_id: tx.id,
                expected: TxState::InProgress,
                actual: tx.state,
            });
        }

        let last_nonce: Option<u64> = conn.get(self.keys.last_nonce_key_name(self.from)).await?;
        let counter = released_counter(last_nonce, tx.nonce, self.release);
        let occupant: Option<String> = conn.get(self.keys.in_progress_key_name(self.from)).await?;

        tx.state = TxState::FatalError;
        tx.error = Some(self.error.to_string());
        tx.terminal_at = Some(self.now);
        if self.release != NonceRelease::Keep {
            tx.nonce = None;
        }

        Ok(FatalUpdate {
            tx_json: serde_json::to_string(&tx)?,
            tx,
            counter,
            release_slot: occupant.as_deref() == Some(self.transaction_id),
        })
    }

    fn operation(&self, pipeline: &mut Pipeline, update: FatalUpdate) -> Transaction {
        let id = self.transaction_id;
        pipeline.set(self.keys.transaction_key_name(id), update.tx_json);
        match update.counter {
            Some(Some(value)) => {
                pipeline.set(self.keys.last_nonce_key_name(self.from), value);
            }
            Some(None) => {
                pipeline.del(self.keys.last_nonce_key_name(self.from));
            }
            None => {}
        }
        if update.release_slot {
            pipeline.del(self.keys.in_progress_key_name(self.from));
        }
        pipeline.zrem(self.keys.unstarted_zset_name(self.from), id);
        pipeline.zrem(self.keys.unconfirmed_zset_name(), id);
        pipeline.srem(self.keys.missing_receipt_set_name(), id);
        pipeline.srem(self.keys.active_set_name(self.from), id);
        pipeline.zadd(self.keys.terminal_zset_name(), id, self.now);
        update.tx
    }
}

/// Confirmer-side state changes, each guarded by the expected prior state.
enum ConfirmerTransition<'a> {
    Confirm {
        expected: TxState,
        confirmation: &'a Confirmation,
    },
    Reorg {
        expected_block_hash: B256,
    },
    MissingReceipt,
}

struct ConfirmerUpdate<'a> {
    keys: &'a RedisTxStoreKeys,
    from: Address,
    transaction_id: &'a str,
    transition: ConfirmerTransition<'a>,
}

impl SafeRedisTransaction for ConfirmerUpdate<'_> {
    type ValidationData = (Transaction, String);
    type OperationResult = Transaction;

    fn name(&self) -> &str {
        match self.transition {
            ConfirmerTransition::Confirm { .. } => "->confirmed",
            ConfirmerTransition::Reorg { .. } => "confirmed->unconfirmed",
            ConfirmerTransition::MissingReceipt => "unconfirmed->confirmed_missing_receipt",
        }
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![self.keys.transaction_key_name(self.transaction_id)]
    }

    async fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<(Transaction, String), TransactionStoreError> {
        let mut tx = require_json(
            conn,
            &self.keys.transaction_key_name(self.transaction_id),
            self.transaction_id,
        )
        .await?;

        match &self.transition {
            ConfirmerTransition::Confirm {
                expected,
                confirmation,
            } => {
                expect_state(&tx, *expected)?;
                if !expected.can_transition_to(TxState::Confirmed) {
                    return Err(TransactionStoreError::UnexpectedState {
                        transaction_id: tx.id,
                        expected: TxState::Unconfirmed,
                        actual: *expected,
                    });
                }
                tx.state = TxState::Confirmed;
                tx.terminal_at = Some(confirmation.confirmed_at);
                tx.confirmation = Some((*confirmation).clone());
            }
            ConfirmerTransition::Reorg {
                expected_block_hash,
            } => {
                expect_state(&tx, TxState::Confirmed)?;
                if tx.confirmation.as_ref().map(|c| c.block_hash) != Some(*expected_block_hash) {
                    return Err(TransactionStoreError::UnexpectedState {
                        transaction_id: tx.id,
                        expected: TxState::Confirmed,
                        actual: tx.state,
                    });
                }
                tx.state = TxState::Unconfirmed;
                tx.confirmation = None;
                tx.terminal_at = None;
            }
            ConfirmerTransition::MissingReceipt => {
                expect_state(&tx, TxState::Unconfirmed)?;
                tx.state = TxState::ConfirmedMissingReceipt;
            }
        }

        let json = serde_json::to_string(&tx)?;
        Ok((tx, json))
    }

    fn operation(&self, pipeline: &mut Pipeline, (tx, json): (Transaction, String)) -> Transaction {
        let id = self.transaction_id;
        pipeline.set(self.keys.transaction_key_name(id), json);

        match &self.transition {
            ConfirmerTransition::Confirm { confirmation, .. } => {
                pipeline.zrem(self.keys.unconfirmed_zset_name(), id);
                pipeline.srem(self.keys.missing_receipt_set_name(), id);
                pipeline.srem(self.keys.active_set_name(self.from), id);
                pipeline.zadd(self.keys.confirmed_zset_name(), id, confirmation.block_number);
                pipeline.zadd(self.keys.terminal_zset_name(), id, confirmation.confirmed_at);
            }
            ConfirmerTransition::Reorg { .. } => {
                pipeline.zrem(self.keys.confirmed_zset_name(), id);
                pipeline.zrem(self.keys.terminal_zset_name(), id);
                pipeline.zadd(
                    self.keys.unconfirmed_zset_name(),
                    id,
                    tx.broadcast_at.unwrap_or_default(),
                );
                pipeline.sadd(self.keys.active_set_name(self.from), id);
            }
            ConfirmerTransition::MissingReceipt => {
                pipeline.zrem(self.keys.unconfirmed_zset_name(), id);
                pipeline.sadd(self.keys.missing_receipt_set_name(), id);
                pipeline.srem(self.keys.active_set_name(self.from), id);
            }
        }
        tx
    }
}

struct TouchBroadcastAt<'a> {
    keys: &'a RedisTxStoreKeys,
    transaction_id: &'a str,
    now: u64,
}

impl SafeRedisTransaction for TouchBroadcastAt<'_> {
    type ValidationData = Option<String>;
    type OperationResult = ();

    fn name(&self) -> &str {
        "touch broadcast_at"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![self.keys.transaction_key_name(self.transaction_id)]
    }

    async fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<String>, TransactionStoreError> {
        let tx: Option<Transaction> =
            get_json(conn, &self.keys.transaction_key_name(self.transaction_id)).await?;
        match tx {
            Some(mut tx) if tx.state == TxState::Unconfirmed => {
                tx.broadcast_at = Some(self.now);
                Ok(Some(serde_json::to_string(&tx)?))
            }
            _ => Ok(None),
        }
    }

    fn operation(&self, pipeline: &mut Pipeline, json: Option<String>) {
        if let Some(json) = json {
            pipeline.set(self.keys.transaction_key_name(self.transaction_id), json);
            pipeline.zadd(self.keys.unconfirmed_zset_name(), self.transaction_id, self.now);
        }
    }
}

enum ReapDecision {
    Delete(Transaction),
    /// Index entry without a record behind it.
    Dangling,
    Keep,
}

struct ReapTransaction<'a> {
    keys: &'a RedisTxStoreKeys,
    transaction_id: &'a str,
    older_than: u64,
}

impl SafeRedisTransaction for ReapTransaction<'_> {
    type ValidationData = ReapDecision;
    type OperationResult = bool;

    fn name(&self) -> &str {
        "reap terminal"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![self.keys.transaction_key_name(self.transaction_id)]
    }

    async fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<ReapDecision, TransactionStoreError> {
        let tx: Option<Transaction> =
            get_json(conn, &self.keys.transaction_key_name(self.transaction_id)).await?;
        Ok(match tx {
            None => ReapDecision::Dangling,
            Some(tx)
                if tx.state.is_terminal()
                    && tx.terminal_at.is_some_and(|at| at <= self.older_than) =>
            {
                ReapDecision::Delete(tx)
            }
            Some(_) => ReapDecision::Keep,
        })
    }

    fn operation(&self, pipeline: &mut Pipeline, decision: ReapDecision) -> bool {
        match decision {
            ReapDecision::Delete(tx) => {
                queue_delete(pipeline, self.keys, &tx);
                true
            }
            ReapDecision::Dangling => {
                pipeline.zrem(self.keys.terminal_zset_name(), self.transaction_id);
                false
            }
            ReapDecision::Keep => false,
        }
    }
}

impl TxStore for RedisTxStore {
    async fn find_by_idempotency_key(
        &self,
        from: Address,
        key: &str,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn
            .hget(self.keys.idempotency_hash_name(from), key)
            .await?;
        match id {
            Some(id) => get_json(&mut conn, &self.keys.transaction_key_name(&id)).await,
            None => Ok(None),
        }
    }

    async fn create_transaction(
        &self,
        tx: Transaction,
        limit: u64,
    ) -> Result<CreateOutcome, TransactionStoreError> {
        self.execute_with_watch_and_retry(&CreateTransaction {
            keys: &self.keys,
            tx: &tx,
            limit,
        })
        .await
    }

    async fn prune_unstarted(
        &self,
        from: Address,
        subject: &str,
        keep: u64,
    ) -> Result<u64, TransactionStoreError> {
        self.execute_with_watch_and_retry(&PruneUnstarted {
            keys: &self.keys,
            from,
            subject,
            keep,
        })
        .await
    }

    async fn count_non_terminal(&self, from: Address) -> Result<u64, TransactionStoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.scard(self.keys.active_set_name(from)).await?)
    }

    async fn next_unstarted(
        &self,
        from: Address,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrange(self.keys.unstarted_zset_name(from), 0, 0).await?;
        match ids.first() {
            Some(id) => get_json(&mut conn, &self.keys.transaction_key_name(id)).await,
            None => Ok(None),
        }
    }

    async fn in_progress_for(
        &self,
        from: Address,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn.get(self.keys.in_progress_key_name(from)).await?;
        match id {
            Some(id) => get_json(&mut conn, &self.keys.transaction_key_name(&id)).await,
            None => Ok(None),
        }
    }

    async fn last_nonce(&self, from: Address) -> Result<Option<u64>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get(self.keys.last_nonce_key_name(from)).await?)
    }

    async fn acquire_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> Result<(), TransactionStoreError> {
        let lock_key = self.keys.lock_key_name(from);
        let mut conn = self.redis.clone();

        let acquired: bool = conn.set_nx(&lock_key, worker_id).await?;
        if acquired {
            return Ok(());
        }

        let previous: Option<String> = conn.get(&lock_key).await?;
        if previous.as_deref() == Some(worker_id) {
            return Ok(());
        }
        tracing::warn!(
            from = %from,
            chain_id = self.keys.chain_id,
            worker_id = %worker_id,
            previous_worker_id = ?previous,
            "Forcefully taking over address lock from stalled worker"
        );
        // no expiry, only released explicitly or taken over
        let _: () = conn.set(&lock_key, worker_id).await?;
        Ok(())
    }

    async fn release_address_lock(
        &self,
        from: Address,
        worker_id: &str,
    ) -> Result<(), TransactionStoreError> {
        self.execute_with_watch_and_retry(&ReleaseLock {
            keys: &self.keys,
            from,
            worker_id,
        })
        .await
    }

    async fn start_transaction(
        &self,
        transaction_id: &str,
        from: Address,
        worker_id: &str,
        chain_next_nonce: Option<u64>,
    ) -> Result<Transaction, TransactionStoreError> {
        self.execute_with_watch_and_retry(&StartTransaction {
            keys: &self.keys,
            transaction_id,
            from,
            worker_id,
            chain_next_nonce,
        })
        .await
    }

    async fn insert_attempt(&self, attempt: Attempt) -> Result<(), TransactionStoreError> {
        self.execute_with_watch_and_retry(&InsertAttempt {
            keys: &self.keys,
            attempt: &attempt,
        })
        .await
    }

    async fn mark_broadcast(
        &self,
        transaction_id: &str,
        attempt_id: &str,
        now: u64,
    ) -> Result<Transaction, TransactionStoreError> {
        let from = self.require_tx(transaction_id).await?.from;
        self.execute_with_watch_and_retry(&UpdateAttempt {
            keys: &self.keys,
            from,
            transaction_id,
            attempt_id,
            state: AttemptState::Broadcast,
            broadcast_at: Some(now),
        })
        .await
    }

    async fn mark_insufficient_funds(
        &self,
        transaction_id: &str,
        attempt_id: &str,
    ) -> Result<(), TransactionStoreError> {
        let from = self.require_tx(transaction_id).await?.from;
        self.execute_with_watch_and_retry(&UpdateAttempt {
            keys: &self.keys,
            from,
            transaction_id,
            attempt_id,
            state: AttemptState::InsufficientFunds,
            broadcast_at: None,
        })
        .await?;
        Ok(())
    }

    async fn mark_fatal(
        &self,
        transaction_id: &str,
        error: &str,
        release: NonceRelease,
        now: u64,
    ) -> Result<Transaction, TransactionStoreError> {
        let from = self.require_tx(transaction_id).await?.from;
        self.execute_with_watch_and_retry(&MarkFatal {
            keys: &self.keys,
            from,
            transaction_id,
            error,
            release,
            now,
        })
        .await
    }

    async fn unconfirmed_with_attempts(
        &self,
    ) -> Result<Vec<(Transaction, Vec<Attempt>)>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let mut ids: Vec<String> = conn.zrange(self.keys.unconfirmed_zset_name(), 0, -1).await?;
        let missing: Vec<String> = conn.smembers(self.keys.missing_receipt_set_name()).await?;
        ids.extend(missing);

        let txs = self.load_many(&ids).await?;
        self.with_attempts(txs).await
    }

    async fn confirmed_since(
        &self,
        min_block: u64,
    ) -> Result<Vec<Transaction>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.confirmed_zset_name(), min_block, "+inf")
            .await?;
        self.load_many(&ids).await
    }

    async fn mark_confirmed(
        &self,
        transaction_id: &str,
        expected: TxState,
        confirmation: Confirmation,
    ) -> Result<Transaction, TransactionStoreError> {
        let from = self.require_tx(transaction_id).await?.from;
        self.execute_with_watch_and_retry(&ConfirmerUpdate {
            keys: &self.keys,
            from,
            transaction_id,
            transition: ConfirmerTransition::Confirm {
                expected,
                confirmation: &confirmation,
            },
        })
        .await
    }

    async fn mark_reorged(
        &self,
        transaction_id: &str,
        expected_block_hash: B256,
    ) -> Result<Transaction, TransactionStoreError> {
        let from = self.require_tx(transaction_id).await?.from;
        self.execute_with_watch_and_retry(&ConfirmerUpdate {
            keys: &self.keys,
            from,
            transaction_id,
            transition: ConfirmerTransition::Reorg {
                expected_block_hash,
            },
        })
        .await
    }

    async fn mark_missing_receipt(&self, transaction_id: &str) -> Result<(), TransactionStoreError> {
        let from = self.require_tx(transaction_id).await?.from;
        self.execute_with_watch_and_retry(&ConfirmerUpdate {
            keys: &self.keys,
            from,
            transaction_id,
            transition: ConfirmerTransition::MissingReceipt,
        })
        .await?;
        Ok(())
    }

    async fn stale_unconfirmed(
        &self,
        older_than: u64,
        limit: usize,
    ) -> Result<Vec<(Transaction, Attempt)>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(
                self.keys.unconfirmed_zset_name(),
                "-inf",
                older_than,
                0,
                limit as isize,
            )
            .await?;

        let txs = self.load_many(&ids).await?;
        Ok(self
            .with_attempts(txs)
            .await?
            .into_iter()
            .filter(|(tx, _)| tx.state == TxState::Unconfirmed)
            .filter_map(|(tx, attempts)| best_attempt(&attempts).cloned().map(|a| (tx, a)))
            .collect())
    }

    async fn touch_broadcast_at(
        &self,
        transaction_ids: &[String],
        now: u64,
    ) -> Result<(), TransactionStoreError> {
        for transaction_id in transaction_ids {
            self.execute_with_watch_and_retry(&TouchBroadcastAt {
                keys: &self.keys,
                transaction_id,
                now,
            })
            .await?;
        }
        Ok(())
    }

    async fn reap(&self, older_than: u64) -> Result<u64, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(self.keys.terminal_zset_name(), "-inf", older_than)
            .await?;

        let mut reaped = 0;
        for transaction_id in &ids {
            let deleted = self
                .execute_with_watch_and_retry(&ReapTransaction {
                    keys: &self.keys,
                    transaction_id,
                    older_than,
                })
                .await?;
            if deleted {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        get_json(&mut conn, &self.keys.transaction_key_name(transaction_id)).await
    }

    async fn attempts_for(&self, transaction_id: &str) -> Result<Vec<Attempt>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        get_attempts(&mut conn, &self.keys.attempts_hash_name(transaction_id)).await
    }
}
