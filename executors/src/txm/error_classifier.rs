use txm_core::error::{ChainError, RpcErrorKind};

use crate::txm::{config::SendErrorPatterns, error::SendErrorKind};

/// Maps node submission errors to a [`SendErrorKind`].
///
/// Only JSON-RPC error responses are matched against the patterns. Anything
/// that never reached a node verdict (timeouts, transport failures, null or
/// malformed responses) is transient.
#[derive(Debug, Clone)]
pub struct SendErrorClassifier {
    patterns: SendErrorPatterns,
}

impl SendErrorClassifier {
    pub fn new(patterns: SendErrorPatterns) -> Self {
        let lowercase = |list: Vec<String>| list.into_iter().map(|p| p.to_lowercase()).collect();
        Self {
            patterns: SendErrorPatterns {
                already_known: lowercase(patterns.already_known),
                nonce_too_low: lowercase(patterns.nonce_too_low),
                insufficient_funds: lowercase(patterns.insufficient_funds),
                fatal: lowercase(patterns.fatal),
            },
        }
    }

    pub fn classify(&self, error: &ChainError) -> SendErrorKind {
        let message = match error {
            ChainError::RpcError {
                kind: RpcErrorKind::ErrorResp(resp),
                ..
            } => resp.message.to_lowercase(),
            _ => return SendErrorKind::Transient,
        };

        let matches = |list: &[String]| list.iter().any(|p| message.contains(p.as_str()));

        if matches(&self.patterns.already_known) {
            SendErrorKind::AlreadyKnown
        } else if matches(&self.patterns.nonce_too_low) {
            SendErrorKind::NonceTooLow
        } else if matches(&self.patterns.insufficient_funds) {
            SendErrorKind::InsufficientFunds
        } else if matches(&self.patterns.fatal) {
            SendErrorKind::Fatal
        } else {
            SendErrorKind::Transient
        }
    }

    /// `None` when the node accepted the transaction.
    pub fn classify_result(&self, result: &Result<(), ChainError>) -> Option<SendErrorKind> {
        result.as_ref().err().map(|e| self.classify(e))
    }
}

impl Default for SendErrorClassifier {
    fn default() -> Self {
        Self::new(SendErrorPatterns::default())
    }
}
