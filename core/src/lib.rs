pub mod chain;
pub mod error;
pub mod gas;
pub mod signer;
pub mod transaction;

pub use chain::{AlloyChain, ChainRpc};
pub use error::{ChainError, RpcErrorKind, SignerError};
pub use gas::{FixedGasEstimator, GasEstimator, GasQuote, RpcGasEstimator};
pub use signer::{KeySet, LocalKeyStore, TxSigner};
pub use transaction::{Head, Receipt, SignedTransaction, UnsignedTransaction};
