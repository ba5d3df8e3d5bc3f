use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    InProgress,
    Unconfirmed,
    Confirmed,
    ConfirmedMissingReceipt,
    FatalError,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Confirmed | TxState::FatalError)
    }

    /// States that occupy a slot in the per-address queue.
    pub fn counts_toward_queue(self) -> bool {
        matches!(
            self,
            TxState::Unstarted | TxState::InProgress | TxState::Unconfirmed
        )
    }

    pub fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        match (self, next) {
            (Unstarted, InProgress) => true,
            (InProgress, Unconfirmed) => true,
            (Unconfirmed, Confirmed) | (Unconfirmed, ConfirmedMissingReceipt) => true,
            (ConfirmedMissingReceipt, Confirmed) => true,
            // reorg
            (Confirmed, Unconfirmed) => true,
            (from, FatalError) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::InProgress => "in_progress",
            TxState::Unconfirmed => "unconfirmed",
            TxState::Confirmed => "confirmed",
            TxState::ConfirmedMissingReceipt => "confirmed_missing_receipt",
            TxState::FatalError => "fatal_error",
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Signed and persisted, outcome of the submission unknown.
    InProgress,
    Broadcast,
    InsufficientFunds,
}

/// Where and when a transaction was mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub tx_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub status: bool,
    pub gas_used: u64,
    pub confirmed_at: u64,
}

/// One logical send intent. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub nonce: Option<u64>,
    pub state: TxState,
    pub idempotency_key: Option<String>,
    pub subject: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub created_at: u64,
    /// Last time any attempt for this transaction was sent.
    pub broadcast_at: Option<u64>,
    /// First time an attempt was accepted by the node.
    pub initial_broadcast_at: Option<u64>,
    pub confirmation: Option<Confirmation>,
    /// Set when the transaction enters a terminal state.
    pub terminal_at: Option<u64>,
    pub error: Option<String>,
}

/// One signed submission of a transaction at a specific gas price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: String,
    pub transaction_id: String,
    pub gas_price: u128,
    pub hash: B256,
    pub signed_raw_transaction: Bytes,
    pub state: AttemptState,
    pub created_at: u64,
}

/// Picks the attempt that is rebroadcast and checked first: highest gas price,
/// ties broken by most recent.
pub fn best_attempt(attempts: &[Attempt]) -> Option<&Attempt> {
    attempts
        .iter()
        .enumerate()
        .max_by_key(|(position, a)| (a.gas_price, a.created_at, *position))
        .map(|(_, a)| a)
}

/// Caller-provided fields of a new transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub from: Address,
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
    pub gas_limit: u64,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

impl NewTransaction {
    pub fn into_transaction(self, chain_id: u64, now: u64) -> Transaction {
        Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            chain_id,
            from: self.from,
            to: self.to,
            value: self.value,
            data: self.data,
            gas_limit: self.gas_limit,
            nonce: None,
            state: TxState::Unstarted,
            idempotency_key: self.idempotency_key,
            subject: self.subject,
            meta: self.meta,
            created_at: now,
            broadcast_at: None,
            initial_broadcast_at: None,
            confirmation: None,
            terminal_at: None,
            error: None,
        }
    }
}

/// Unix timestamp in milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
