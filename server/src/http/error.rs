use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::json;
use txm_executors::txm::{AdmissionError, TransactionStoreError};

/// Errors the HTTP API turns into responses.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "errorCode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiTxmError {
    #[error("{source}")]
    Admission {
        #[from]
        source: AdmissionError,
    },

    #[error("Transaction store error: {source}")]
    Store {
        #[from]
        source: TransactionStoreError,
    },

    #[error("Transaction {transaction_id} not found")]
    NotFound { transaction_id: String },

    #[error("Address {from} is not managed by this node")]
    UnmanagedAddress { from: alloy::primitives::Address },
}

impl IntoResponse for ApiTxmError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }

        (
            status,
            Json(json!({
                "error": {
                    "message": self.to_string(),
                    "details": self.details()
                }
            })),
        )
            .into_response()
    }
}

impl ApiTxmError {
    /// Admission failures are reported with their own `errorCode`
    /// (`QUEUE_FULL`, `ZERO_ADDRESS`, ...) rather than nested under `source`.
    fn details(&self) -> serde_json::Value {
        match self {
            ApiTxmError::Admission { source } => json!(source),
            other => json!(other),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiTxmError::Admission { source } => match source {
                AdmissionError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
                AdmissionError::ZeroAddress => StatusCode::BAD_REQUEST,
                AdmissionError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiTxmError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiTxmError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiTxmError::UnmanagedAddress { .. } => StatusCode::BAD_REQUEST,
        }
    }
}
