// Event ingress: `POST /v1/publish/:channel` emits the JSON body on the bus.
use crate::api::types::PublishAccepted;
use crate::app::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::Value;

pub async fn publish(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<PublishAccepted>) {
    let distributed = state.bus.is_distributed() && state.bus.is_distributed_channel(&channel);
    state.bus.emit(&channel, &payload).await;
    metrics::counter!("courier_gateway_publish_requests_total").increment(1);
    tracing::debug!(channel = %channel, distributed, "event accepted");
    (
        StatusCode::ACCEPTED,
        Json(PublishAccepted {
            channel,
            distributed,
        }),
    )
}
