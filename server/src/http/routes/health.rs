use axum::{Json, extract::State};
use serde::Serialize;
use txm_executors::txm::TxStore;

use crate::http::server::NodeServerState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub chain_id: u64,
    pub running: bool,
    pub latest_head: Option<u64>,
}

pub async fn health<S: TxStore>(State(state): State<NodeServerState<S>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        chain_id: state.manager.chain_id(),
        running: state.manager.is_running().await,
        latest_head: state.manager.latest_head().map(|head| head.number),
    })
}
