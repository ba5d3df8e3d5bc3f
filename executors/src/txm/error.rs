use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use txm_core::error::{ChainError, SignerError};

use crate::txm::store::TransactionStoreError;

/// How the node answered a raw transaction submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendErrorKind {
    /// The node already has this exact transaction. Treated as success.
    AlreadyKnown,
    InsufficientFunds,
    NonceTooLow,
    /// Deterministic rejection. Resubmitting the same bytes cannot succeed.
    Fatal,
    /// Timeouts, connection failures and anything unrecognised.
    Transient,
}

/// Errors reported synchronously to callers creating transactions.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
#[serde(tag = "errorCode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionError {
    #[error("Transaction queue for {from} is full ({count}/{limit})")]
    QueueFull {
        from: Address,
        count: u64,
        limit: u64,
    },

    #[error("Cannot send transaction to the zero address")]
    ZeroAddress,

    #[error("Transaction store error: {source}")]
    Store {
        #[from]
        source: TransactionStoreError,
    },
}

/// Errors raised inside the background workers.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
#[serde(tag = "errorCode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxmError {
    #[error("Transaction store error: {source}")]
    Store {
        #[from]
        source: TransactionStoreError,
    },

    #[error("Chain error: {source}")]
    Chain {
        #[from]
        source: ChainError,
    },

    #[error("Signer error: {source}")]
    Signer {
        #[from]
        source: SignerError,
    },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Invariant violated: {message}")]
    Invariant { message: String },

    #[error("Transaction manager is already running")]
    AlreadyRunning,

    #[error("Worker failed: {message}")]
    Worker { message: String },
}

impl TxmError {
    /// Errors the lifecycle controller escalates and that should end the process.
    pub fn is_fatal_to_process(&self) -> bool {
        match self {
            TxmError::Invariant { .. } => true,
            TxmError::Store { source } => source.is_corruption(),
            _ => false,
        }
    }

    pub fn is_lock_lost(&self) -> bool {
        matches!(
            self,
            TxmError::Store {
                source: TransactionStoreError::LockLost { .. }
            }
        )
    }
}
