use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use txm_executors::txm::{Attempt, NewTransaction, QueueStrategyKind, Transaction, TxStore};

use crate::http::{error::ApiTxmError, server::NodeServerState};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    #[serde(flatten)]
    pub transaction: NewTransaction,
    /// How the address's backlog is pruned before this transaction is queued.
    #[serde(default)]
    pub strategy: QueueStrategyKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub transaction: Transaction,
    pub attempts: Vec<Attempt>,
}

/// Queue a transaction for sending. Repeating a request with the same
/// idempotency key returns the transaction created the first time.
pub async fn create_transaction<S: TxStore>(
    State(state): State<NodeServerState<S>>,
    Json(request): Json<CreateTransactionRequest>,
) -> Result<impl IntoResponse, ApiTxmError> {
    let from = request.transaction.from;
    if !state.manager.manages(from) {
        return Err(ApiTxmError::UnmanagedAddress { from });
    }

    let transaction = state
        .manager
        .create_transaction(request.transaction, &request.strategy)
        .await?;

    tracing::info!(transaction_id = %transaction.id, from = %from, "Transaction queued");
    Ok((StatusCode::CREATED, Json(transaction)))
}

pub async fn get_transaction<S: TxStore>(
    State(state): State<NodeServerState<S>>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionResponse>, ApiTxmError> {
    match state.manager.get_transaction(&transaction_id).await? {
        Some((transaction, attempts)) => Ok(Json(TransactionResponse {
            transaction,
            attempts,
        })),
        None => Err(ApiTxmError::NotFound { transaction_id }),
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::json;
    use tower::ServiceExt;
    use txm_executors::txm::TxmConfig;

    use super::*;
    use crate::http::{routes::testing::*, server::router};

    fn post(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/transactions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn transfer(from: &str) -> serde_json::Value {
        json!({
            "from": from,
            "to": "0x00000000000000000000000000000000000000c3",
            "gasLimit": 21000,
        })
    }

    #[tokio::test]
    async fn create_returns_unstarted_transaction() {
        let app = router(state(TxmConfig::default()));

        let response = app
            .oneshot(post(transfer(&ANVIL_ADDRESS.to_string())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["state"], "unstarted");
        assert_eq!(body["chainId"], CHAIN_ID);
        assert!(body["nonce"].is_null());
    }

    #[tokio::test]
    async fn create_rejects_unmanaged_sender() {
        let app = router(state(TxmConfig::default()));

        let response = app
            .oneshot(post(transfer("0x00000000000000000000000000000000000000a1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["details"]["errorCode"], "UNMANAGED_ADDRESS");
    }

    #[tokio::test]
    async fn full_queue_is_too_many_requests() {
        let config = TxmConfig {
            queue_depth_limit: 1,
            ..TxmConfig::default()
        };
        let app = router(state(config));

        let first = app
            .clone()
            .oneshot(post(transfer(&ANVIL_ADDRESS.to_string())))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(post(transfer(&ANVIL_ADDRESS.to_string())))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(second).await;
        assert_eq!(body["error"]["details"]["errorCode"], "QUEUE_FULL");
        assert_eq!(body["error"]["details"]["count"], 1);
    }

    #[tokio::test]
    async fn idempotent_create_returns_same_transaction() {
        let app = router(state(TxmConfig::default()));
        let mut request = transfer(&ANVIL_ADDRESS.to_string());
        request["idempotencyKey"] = json!("order-42");

        let first = body_json(app.clone().oneshot(post(request.clone())).await.unwrap()).await;
        let second = body_json(app.oneshot(post(request)).await.unwrap()).await;

        assert_eq!(first["id"], second["id"]);
    }

    #[tokio::test]
    async fn get_returns_transaction_with_attempts() {
        let app = router(state(TxmConfig::default()));
        let created = body_json(
            app.clone()
                .oneshot(post(transfer(&ANVIL_ADDRESS.to_string())))
                .await
                .unwrap(),
        )
        .await;
        let id = created["id"].as_str().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/transactions/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["transaction"]["id"], id);
        assert_eq!(body["attempts"], json!([]));
    }

    #[tokio::test]
    async fn get_unknown_transaction_is_not_found() {
        let app = router(state(TxmConfig::default()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/transactions/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["details"]["errorCode"], "NOT_FOUND");
        assert_eq!(body["error"]["details"]["transaction_id"], "missing");
    }
}
