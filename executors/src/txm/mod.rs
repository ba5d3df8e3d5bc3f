pub mod admission;
pub mod broadcaster;
pub mod config;
pub mod confirmer;
pub mod context;
pub mod error;
pub mod error_classifier;
pub mod head_tracker;
pub mod lifecycle;
pub mod queue_strategy;
pub mod reaper;
pub mod resender;
pub mod store;
pub mod types;

pub use admission::{AdmissionGate, WakeRegistry};
pub use broadcaster::{Broadcaster, SendFlow};
pub use config::{SendErrorPatterns, TxmConfig};
pub use confirmer::{Confirmer, ConfirmerReport};
pub use context::TxmContext;
pub use error::{AdmissionError, SendErrorKind, TxmError};
pub use error_classifier::SendErrorClassifier;
pub use head_tracker::HeadTracker;
pub use lifecycle::TxManager;
pub use queue_strategy::{DropOldestStrategy, QueueStrategy, QueueStrategyKind, SendEveryStrategy};
pub use reaper::Reaper;
pub use resender::Resender;
pub use store::{
    CreateOutcome, MemoryTxStore, NonceRelease, RedisTxStore, TransactionStoreError, TxStore,
};
pub use types::{
    Attempt, AttemptState, Confirmation, NewTransaction, Transaction, TxState, best_attempt,
    now_ms,
};
