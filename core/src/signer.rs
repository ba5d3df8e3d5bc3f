use std::{collections::HashMap, str::FromStr, sync::Arc};

use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
    primitives::{Address, TxKind},
    signers::{SignerSync, local::PrivateKeySigner},
};
use tokio::sync::{RwLock, watch};

use crate::{
    error::SignerError,
    transaction::{SignedTransaction, UnsignedTransaction},
};

/// Signs transactions on behalf of managed sending addresses.
pub trait TxSigner: Send + Sync + 'static {
    fn sign(
        &self,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> impl Future<Output = Result<SignedTransaction, SignerError>> + Send;
}

/// The set of sending addresses the node manages, with change notification.
pub trait KeySet: Send + Sync + 'static {
    fn addresses(&self) -> Vec<Address>;

    /// Receiver that observes every change to the managed address set.
    fn subscribe(&self) -> watch::Receiver<Vec<Address>>;
}

/// In-process key store holding raw secp256k1 keys.
#[derive(Clone)]
pub struct LocalKeyStore {
    keys: Arc<RwLock<HashMap<Address, PrivateKeySigner>>>,
    addresses: Arc<watch::Sender<Vec<Address>>>,
}

impl LocalKeyStore {
    pub fn new() -> Self {
        let (addresses, _) = watch::channel(Vec::new());
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
            addresses: Arc::new(addresses),
        }
    }

    /// Build a store from hex-encoded private keys (with or without `0x`).
    pub fn from_private_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, SignerError> {
        let mut signers = HashMap::new();
        for key in keys {
            let signer = parse_key(key.as_ref())?;
            signers.insert(signer.address(), signer);
        }

        let mut addresses: Vec<Address> = signers.keys().copied().collect();
        addresses.sort();
        let (sender, _) = watch::channel(addresses);

        Ok(Self {
            keys: Arc::new(RwLock::new(signers)),
            addresses: Arc::new(sender),
        })
    }

    pub async fn add_key(&self, private_key: &str) -> Result<Address, SignerError> {
        let signer = parse_key(private_key)?;
        let address = signer.address();

        let mut keys = self.keys.write().await;
        keys.insert(address, signer);
        self.publish(&keys);

        tracing::info!(address = ?address, "Added signing key");
        Ok(address)
    }

    pub async fn remove_key(&self, address: Address) -> bool {
        let mut keys = self.keys.write().await;
        let removed = keys.remove(&address).is_some();
        if removed {
            self.publish(&keys);
            tracing::info!(address = ?address, "Removed signing key");
        }
        removed
    }

    fn publish(&self, keys: &HashMap<Address, PrivateKeySigner>) {
        let mut addresses: Vec<Address> = keys.keys().copied().collect();
        addresses.sort();
        self.addresses.send_replace(addresses);
    }
}

impl Default for LocalKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_key(private_key: &str) -> Result<PrivateKeySigner, SignerError> {
    PrivateKeySigner::from_str(private_key.trim()).map_err(|e| SignerError::InvalidKey {
        message: e.to_string(),
    })
}

impl TxSigner for LocalKeyStore {
    async fn sign(
        &self,
        from: Address,
        tx: &UnsignedTransaction,
    ) -> Result<SignedTransaction, SignerError> {
        let keys = self.keys.read().await;
        let signer = keys
            .get(&from)
            .ok_or(SignerError::UnknownAddress { address: from })?;

        let legacy = TxLegacy {
            chain_id: Some(tx.chain_id),
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            to: TxKind::Call(tx.to),
            value: tx.value,
            input: tx.input.clone(),
        };

        let signature = signer
            .sign_hash_sync(&legacy.signature_hash())
            .map_err(|e| SignerError::SigningFailed {
                address: from,
                message: e.to_string(),
            })?;

        let envelope = TxEnvelope::Legacy(legacy.into_signed(signature));

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: envelope.encoded_2718().into(),
        })
    }
}

impl KeySet for LocalKeyStore {
    fn addresses(&self) -> Vec<Address> {
        self.addresses.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Vec<Address>> {
        self.addresses.subscribe()
    }
}
