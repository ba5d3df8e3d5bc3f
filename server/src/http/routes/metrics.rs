use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, TextEncoder};
use txm_executors::txm::TxStore;

use crate::http::server::NodeServerState;

/// Prometheus text exposition of the node's registry.
pub async fn get_metrics<S: TxStore>(
    State(state): State<NodeServerState<S>>,
) -> Result<Response, MetricsError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.metrics_registry.gather(), &mut buffer)
        .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;

    let output = String::from_utf8(buffer).map_err(|e| MetricsError::Utf8Error(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
        .into_response())
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to encode metrics: {0}")]
    EncodingFailed(String),

    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(String),
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Metrics export failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Metrics export failed: {self}"),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;
    use txm_executors::{metrics::TxmMetrics, txm::TxmConfig};

    use super::*;
    use crate::http::{routes::testing::*, server::router};

    #[tokio::test]
    async fn exports_registered_txm_metrics() {
        let state = state(TxmConfig::default());
        let _metrics = TxmMetrics::new(&state.metrics_registry).unwrap();
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
