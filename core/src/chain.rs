use alloy::{
    eips::BlockNumberOrTag,
    network::ReceiptResponse,
    primitives::{Address, B256, Bytes},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::{
        json_rpc::{RpcRecv, RpcSend},
        types::TransactionReceipt,
    },
    transports::http::reqwest::Url,
};
use futures::future::join_all;

use crate::{
    error::{AlloyRpcErrorToChainError, ChainError},
    transaction::{Head, Receipt},
};

/// The RPC surface the transaction manager needs from one chain.
///
/// Batched calls return one result per input item, in input order.
pub trait ChainRpc: Send + Sync + 'static {
    fn chain_id(&self) -> u64;

    fn submit_raw(&self, raw: &Bytes) -> impl Future<Output = Result<(), ChainError>> + Send;

    fn batch_submit_raw(
        &self,
        raws: &[Bytes],
    ) -> impl Future<Output = Vec<Result<(), ChainError>>> + Send;

    /// `Ok(None)` means the transaction is not mined (or not known) yet.
    fn get_receipts(
        &self,
        hashes: &[B256],
    ) -> impl Future<Output = Vec<Result<Option<Receipt>, ChainError>>> + Send;

    fn pending_nonce_at(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn latest_head(&self) -> impl Future<Output = Result<Head, ChainError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<u128, ChainError>> + Send;
}

/// [`ChainRpc`] over a plain HTTP JSON-RPC endpoint.
#[derive(Clone, Debug)]
pub struct AlloyChain {
    chain_id: u64,
    rpc_url: Url,
    pub provider: RootProvider,
}

impl AlloyChain {
    pub fn new(chain_id: u64, rpc_url: &str) -> Result<Self, ChainError> {
        let rpc_url = Url::parse(rpc_url).map_err(|e| ChainError::RpcConfigError {
            message: format!("Failed to parse RPC URL: {e}"),
        })?;

        Ok(AlloyChain {
            chain_id,
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url.clone()),
            rpc_url,
        })
    }

    pub fn rpc_url(&self) -> &Url {
        &self.rpc_url
    }

    /// Send one JSON-RPC batch with a `method` call per item of `params`.
    /// Results come back in input order; a failed batch fails every item.
    async fn batch_call<P, R>(
        &self,
        method: &'static str,
        params: impl IntoIterator<Item = P>,
    ) -> Vec<Result<R, ChainError>>
    where
        P: RpcSend,
        R: RpcRecv,
    {
        let mut batch = alloy::rpc::client::BatchRequest::new(self.provider.client());
        let mut waiters = Vec::new();
        for item in params {
            waiters.push(
                batch
                    .add_call::<P, R>(method, &item)
                    .map_err(|e| e.to_chain_error(self.chain_id)),
            );
        }
        if waiters.is_empty() {
            return Vec::new();
        }

        if let Err(e) = batch.send().await {
            let error = e.to_chain_error(self.chain_id);
            return waiters.iter().map(|_| Err(error.clone())).collect();
        }

        join_all(waiters.into_iter().map(|waiter| async move {
            waiter?.await.map_err(|e| e.to_chain_error(self.chain_id))
        }))
        .await
    }
}

fn to_receipt(receipt: TransactionReceipt) -> Receipt {
    Receipt {
        status: ReceiptResponse::status(&receipt),
        tx_hash: ReceiptResponse::transaction_hash(&receipt),
        block_hash: ReceiptResponse::block_hash(&receipt).unwrap_or_default(),
        block_number: ReceiptResponse::block_number(&receipt).unwrap_or_default(),
        gas_used: ReceiptResponse::gas_used(&receipt),
        logs: receipt.inner.logs().to_vec(),
    }
}

impl ChainRpc for AlloyChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn submit_raw(&self, raw: &Bytes) -> Result<(), ChainError> {
        self.provider
            .send_raw_transaction(raw)
            .await
            .map(|_pending| ())
            .map_err(|e| e.to_chain_error(self.chain_id))
    }

    async fn batch_submit_raw(&self, raws: &[Bytes]) -> Vec<Result<(), ChainError>> {
        self.batch_call::<_, B256>("eth_sendRawTransaction", raws.iter().map(|raw| (raw.clone(),)))
            .await
            .into_iter()
            .map(|result| result.map(|_hash| ()))
            .collect()
    }

    async fn get_receipts(&self, hashes: &[B256]) -> Vec<Result<Option<Receipt>, ChainError>> {
        self.batch_call::<_, Option<TransactionReceipt>>(
            "eth_getTransactionReceipt",
            hashes.iter().map(|hash| (*hash,)),
        )
        .await
        .into_iter()
        .map(|result| {
            result.map(|receipt| {
                receipt
                    // pending receipts from some nodes come back without a block
                    .filter(|r| ReceiptResponse::block_hash(r).is_some())
                    .map(to_receipt)
            })
        })
        .collect()
    }

    async fn pending_nonce_at(&self, address: Address) -> Result<u64, ChainError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| e.to_chain_error(self.chain_id))
    }

    async fn latest_head(&self) -> Result<Head, ChainError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(|e| e.to_chain_error(self.chain_id))?
            .ok_or_else(|| ChainError::RpcError {
                chain_id: self.chain_id,
                message: "latest block not available".to_string(),
                kind: crate::error::RpcErrorKind::NullResp,
            })?;

        Ok(Head {
            number: block.header.number,
            hash: block.header.hash,
        })
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| e.to_chain_error(self.chain_id))
    }
}
