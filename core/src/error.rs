use std::time::Duration;

use alloy::{
    primitives::Address,
    transports::{RpcError as AlloyRpcError, TransportErrorKind},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: {0}")]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    /// Rpc server returned an unsupported feature.
    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// Returned when a local pre-processing step fails.
    #[error("local usage error: {message}")]
    InternalError { message: String },

    #[error("serialization error: {message}")]
    SerError { message: String },

    #[error("deserialization error: {message}, text: {text}")]
    DeserError { message: String, text: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcErrorResponse {
    /// The error code.
    pub code: i64,
    /// The error message (if any).
    pub message: String,
    /// The error data (if any).
    pub data: Option<String>,
}

impl std::fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by a [`crate::chain::ChainRpc`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "errorCode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainError {
    #[error("RPC error on chain {chain_id}: {message}")]
    RpcError {
        chain_id: u64,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("RPC call {operation} on chain {chain_id} timed out after {timeout_ms}ms")]
    Timeout {
        chain_id: u64,
        operation: String,
        timeout_ms: u64,
    },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },
}

impl ChainError {
    /// Build an error-response error, mostly useful for scripted chains in tests.
    pub fn error_resp(chain_id: u64, code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        ChainError::RpcError {
            chain_id,
            message: message.clone(),
            kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
                code,
                message,
                data: None,
            }),
        }
    }

    pub fn transport(chain_id: u64, message: impl Into<String>) -> Self {
        let message = message.into();
        ChainError::RpcError {
            chain_id,
            message: message.clone(),
            kind: RpcErrorKind::OtherTransportError { message },
        }
    }

    /// The node's error response, if the node answered at all.
    pub fn error_response(&self) -> Option<&RpcErrorResponse> {
        match self {
            ChainError::RpcError {
                kind: RpcErrorKind::ErrorResp(resp),
                ..
            } => Some(resp),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ChainError::Timeout { .. })
    }
}

/// Run an RPC future under a deadline. Elapsed deadlines become [`ChainError::Timeout`].
pub async fn with_rpc_timeout<T>(
    chain_id: u64,
    timeout: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T, ChainError>>,
) -> Result<T, ChainError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout {
            chain_id,
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn to_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
    }
}

pub trait AlloyRpcErrorToChainError {
    fn to_chain_error(&self, chain_id: u64) -> ChainError;
}

impl AlloyRpcErrorToChainError for AlloyRpcError<TransportErrorKind> {
    fn to_chain_error(&self, chain_id: u64) -> ChainError {
        ChainError::RpcError {
            chain_id,
            message: self.to_string(),
            kind: to_rpc_error_kind(self),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "errorCode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignerError {
    #[error("No signing key managed for address {address}")]
    UnknownAddress { address: Address },

    #[error("Invalid private key: {message}")]
    InvalidKey { message: String },

    #[error("Signing failed for {address}: {message}")]
    SigningFailed { address: Address, message: String },
}
