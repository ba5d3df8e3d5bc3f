use std::sync::Arc;

use txm_core::chain::ChainRpc;

use crate::txm::{config::TxmConfig, error_classifier::SendErrorClassifier};

/// Collaborators shared by every worker of one transaction manager.
pub struct TxmContext<C, T, S, G> {
    pub chain: Arc<C>,
    pub signer: Arc<T>,
    pub store: Arc<S>,
    pub gas: Arc<G>,
    pub config: Arc<TxmConfig>,
    pub classifier: Arc<SendErrorClassifier>,
}

impl<C, T, S, G> Clone for TxmContext<C, T, S, G> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            signer: self.signer.clone(),
            store: self.store.clone(),
            gas: self.gas.clone(),
            config: self.config.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

impl<C: ChainRpc, T, S, G> TxmContext<C, T, S, G> {
    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }
}
