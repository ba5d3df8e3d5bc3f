use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::txm::error::TxmError;

/// Typed configuration for one transaction manager instance.
///
/// Built once at startup, validated with [`TxmConfig::validate`], then shared
/// read-only with every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxmConfig {
    /// Non-terminal transactions allowed per address. `0` disables the check.
    #[serde(default = "default_queue_depth_limit")]
    pub queue_depth_limit: u64,

    #[serde(default = "default_resend_after_threshold_ms")]
    pub resend_after_threshold_ms: u64,

    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,

    /// Retention of terminal transactions.
    #[serde(default = "default_reap_threshold_ms")]
    pub reap_threshold_ms: u64,

    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// Confirmed transactions this close to the head are re-validated on every head.
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,

    /// Blocks on top of the receipt's block before it is promoted to confirmed.
    #[serde(default)]
    pub min_confirmations: u64,

    /// Time since first broadcast after which a receipt-less transaction is
    /// flagged as `confirmed_missing_receipt`.
    #[serde(default = "default_missing_receipt_threshold_ms")]
    pub missing_receipt_threshold_ms: u64,

    #[serde(default = "default_rpc_batch_size")]
    pub rpc_batch_size: usize,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_send_retry_attempts")]
    pub send_retry_attempts: u32,

    #[serde(default = "default_send_retry_backoff_ms")]
    pub send_retry_backoff_ms: u64,

    #[serde(default = "default_broadcaster_poll_interval_ms")]
    pub broadcaster_poll_interval_ms: u64,

    #[serde(default = "default_head_poll_interval_ms")]
    pub head_poll_interval_ms: u64,

    #[serde(default)]
    pub send_error_patterns: SendErrorPatterns,
}

fn default_queue_depth_limit() -> u64 {
    250
}

fn default_resend_after_threshold_ms() -> u64 {
    60_000
}

fn default_resend_interval_ms() -> u64 {
    15_000
}

fn default_reap_threshold_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_reap_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_finality_depth() -> u64 {
    50
}

fn default_missing_receipt_threshold_ms() -> u64 {
    30 * 60 * 1000
}

fn default_rpc_batch_size() -> usize {
    100
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_send_retry_attempts() -> u32 {
    3
}

fn default_send_retry_backoff_ms() -> u64 {
    500
}

fn default_broadcaster_poll_interval_ms() -> u64 {
    5_000
}

fn default_head_poll_interval_ms() -> u64 {
    2_000
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            queue_depth_limit: default_queue_depth_limit(),
            resend_after_threshold_ms: default_resend_after_threshold_ms(),
            resend_interval_ms: default_resend_interval_ms(),
            reap_threshold_ms: default_reap_threshold_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            finality_depth: default_finality_depth(),
            min_confirmations: 0,
            missing_receipt_threshold_ms: default_missing_receipt_threshold_ms(),
            rpc_batch_size: default_rpc_batch_size(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            send_retry_attempts: default_send_retry_attempts(),
            send_retry_backoff_ms: default_send_retry_backoff_ms(),
            broadcaster_poll_interval_ms: default_broadcaster_poll_interval_ms(),
            head_poll_interval_ms: default_head_poll_interval_ms(),
            send_error_patterns: SendErrorPatterns::default(),
        }
    }
}

impl TxmConfig {
    pub fn validate(&self) -> Result<(), TxmError> {
        let non_zero = [
            ("resend_interval_ms", self.resend_interval_ms),
            ("reap_interval_ms", self.reap_interval_ms),
            ("rpc_batch_size", self.rpc_batch_size as u64),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
            ("send_retry_attempts", self.send_retry_attempts as u64),
            ("broadcaster_poll_interval_ms", self.broadcaster_poll_interval_ms),
            ("head_poll_interval_ms", self.head_poll_interval_ms),
        ];

        for (field, value) in non_zero {
            if value == 0 {
                return Err(TxmError::Config {
                    message: format!("{field} must be greater than zero"),
                });
            }
        }

        if self.min_confirmations > self.finality_depth {
            return Err(TxmError::Config {
                message: format!(
                    "min_confirmations ({}) cannot exceed finality_depth ({})",
                    self.min_confirmations, self.finality_depth
                ),
            });
        }

        Ok(())
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn send_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.send_retry_backoff_ms)
    }

    pub fn broadcaster_poll_interval(&self) -> Duration {
        Duration::from_millis(self.broadcaster_poll_interval_ms)
    }

    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_interval_ms)
    }
}

/// Lowercase substrings used to classify node error messages.
///
/// Node clients phrase these differently, so deployments extend the lists
/// through configuration instead of patching the classifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendErrorPatterns {
    #[serde(default = "default_already_known")]
    pub already_known: Vec<String>,

    #[serde(default = "default_nonce_too_low")]
    pub nonce_too_low: Vec<String>,

    #[serde(default = "default_insufficient_funds")]
    pub insufficient_funds: Vec<String>,

    #[serde(default = "default_fatal")]
    pub fatal: Vec<String>,
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_already_known() -> Vec<String> {
    to_strings(&[
        "already known",
        "known transaction",
        "alreadyknown",
        "transaction already imported",
        "transaction already exists",
    ])
}

fn default_nonce_too_low() -> Vec<String> {
    to_strings(&[
        "nonce too low",
        "nonce is too low",
        "oldnonce",
        "nonce has already been used",
        "invalid transaction nonce",
    ])
}

fn default_insufficient_funds() -> Vec<String> {
    to_strings(&[
        "insufficient funds",
        "insufficient balance",
        "insufficientfunds",
        "upfront cost exceeds account balance",
        "sender doesn't have enough funds",
    ])
}

fn default_fatal() -> Vec<String> {
    to_strings(&[
        "invalid sender",
        "invalid signature",
        "exceeds block gas limit",
        "intrinsic gas too low",
        "oversized data",
        "transaction type not supported",
        "invalid chain id",
        "rlp: ",
    ])
}

impl Default for SendErrorPatterns {
    fn default() -> Self {
        Self {
            already_known: default_already_known(),
            nonce_too_low: default_nonce_too_low(),
            insufficient_funds: default_insufficient_funds(),
            fatal: default_fatal(),
        }
    }
}

impl SendErrorPatterns {
    /// Add deployment-specific patterns on top of the current lists.
    pub fn extend(&mut self, other: SendErrorPatterns) {
        fn merge(into: &mut Vec<String>, from: Vec<String>) {
            for pattern in from {
                let pattern = pattern.to_lowercase();
                if !into.contains(&pattern) {
                    into.push(pattern);
                }
            }
        }

        merge(&mut self.already_known, other.already_known);
        merge(&mut self.nonce_too_low, other.nonce_too_low);
        merge(&mut self.insufficient_funds, other.insufficient_funds);
        merge(&mut self.fatal, other.fatal);
    }
}
