use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{chain::ChainRpc, error::ChainError};

/// Price and limit for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasQuote {
    pub gas_price: u128,
    pub gas_limit: u64,
}

/// Pluggable pricing strategy. Prediction lives behind this trait.
pub trait GasEstimator: Send + Sync + 'static {
    fn quote(&self, gas_limit: u64) -> impl Future<Output = Result<GasQuote, ChainError>> + Send;
}

#[derive(Debug, Clone)]
pub struct FixedGasEstimator {
    pub gas_price: u128,
}

impl FixedGasEstimator {
    pub fn new(gas_price: u128) -> Self {
        Self { gas_price }
    }
}

impl GasEstimator for FixedGasEstimator {
    async fn quote(&self, gas_limit: u64) -> Result<GasQuote, ChainError> {
        Ok(GasQuote {
            gas_price: self.gas_price,
            gas_limit,
        })
    }
}

/// Uses the node's `eth_gasPrice`, never going below `floor`.
pub struct RpcGasEstimator<C: ChainRpc> {
    chain: Arc<C>,
    floor: u128,
}

impl<C: ChainRpc> RpcGasEstimator<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self { chain, floor: 0 }
    }

    pub fn with_floor(mut self, floor: u128) -> Self {
        self.floor = floor;
        self
    }
}

impl<C: ChainRpc> GasEstimator for RpcGasEstimator<C> {
    async fn quote(&self, gas_limit: u64) -> Result<GasQuote, ChainError> {
        let gas_price = self.chain.gas_price().await?;
        Ok(GasQuote {
            gas_price: gas_price.max(self.floor),
            gas_limit,
        })
    }
}
