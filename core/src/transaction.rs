use alloy::{
    primitives::{Address, B256, Bytes, U256},
    rpc::types::Log,
};
use serde::{Deserialize, Serialize};

/// A canonical chain head as seen by the RPC node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub number: u64,
    pub hash: B256,
}

/// Read-only projection of a mined transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub status: bool,
    pub tx_hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
    #[serde(default)]
    pub logs: Vec<Log>,
}

/// A legacy-priced transaction ready to be handed to a [`crate::signer::TxSigner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: u64,
    pub gas_price: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub hash: B256,
    pub raw: Bytes,
}
