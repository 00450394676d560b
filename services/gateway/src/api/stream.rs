//! Streaming endpoints.
//!
//! # Purpose
//! `GET /v1/stream` runs a dedicated connection per request; `GET /v1/events`
//! runs a cooperative scheduler with one broker polling source.
//!
//! # Notes
//! Both return the SSE response immediately and drive the stream from a
//! spawned task. Headers therefore reach the client before eviction and
//! registration of a dedicated connection happen.
use crate::api::error::{ApiError, api_unavailable, api_validation_error};
use crate::api::identity::identity_from_headers;
use crate::api::types::ChannelsQuery;
use crate::app::AppState;
use crate::config::parse_channel_list;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::Response;
use courier_broker::Broker;
use courier_stream::sse::{self, RESPONSE_HEADERS, SseBody};
use courier_stream::{BrokerPollSource, Reply, Scheduler, SchedulerExit, Teardown};
use serde_json::Value;

fn requested_channels(query: &ChannelsQuery) -> Result<Vec<String>, ApiError> {
    let channels = query
        .channels
        .as_deref()
        .map(parse_channel_list)
        .unwrap_or_default();
    if channels.is_empty() {
        return Err(api_validation_error("channels must not be empty"));
    }
    Ok(channels)
}

/// Wrap `body` in a streaming response with the SSE header set.
pub fn sse_response(body: SseBody) -> Response {
    let mut response = Response::new(Body::from_stream(body.into_stream()));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    for (name, value) in RESPONSE_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}

fn forward(_channel: &str, payload: &Value) -> Reply {
    Reply::send(payload.clone())
}

pub async fn dedicated_stream(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<ChannelsQuery>,
) -> Result<Response, ApiError> {
    let identity = identity_from_headers(&headers)?;
    let channels = requested_channels(&query)?;
    let path = uri.path().to_string();
    let (writer, body) = sse::channel();
    let setup = state.setup.clone();

    tokio::spawn(async move {
        let connection = match setup.open(&identity, &path, writer.clone()).await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "dedicated stream could not open");
                writer.close();
                return;
            }
        };
        let id = connection.id();
        tracing::info!(connection_id = %id, path = %path, channels = ?channels, "dedicated stream open");
        let reason = connection.subscribe(channels, forward).await;
        tracing::info!(connection_id = %id, reason = reason.as_label(), "dedicated stream ended");
    });

    Ok(sse_response(body))
}

pub async fn polled_events(
    State(state): State<AppState>,
    Query(query): Query<ChannelsQuery>,
) -> Result<Response, ApiError> {
    let channels = requested_channels(&query)?;
    // Non-blocking reads only; the read timeout does not apply.
    let options = state.options.without_read_timeout();
    let connection = state
        .broker
        .connect(&options)
        .await
        .map_err(|err| api_unavailable("broker unavailable", &err))?;

    let (writer, body) = sse::channel();
    let mut scheduler = Scheduler::new(state.stream.tick_interval);
    scheduler.add_source(
        BrokerPollSource::new(connection, channels, forward)
            .with_max_frames_per_tick(state.stream.max_frames_per_tick),
    );

    tokio::spawn(async move {
        let mut teardown = Teardown::new();
        let exit = scheduler.run(&writer, &mut teardown).await;
        match exit {
            SchedulerExit::ClientGone => tracing::debug!("polled stream client went away"),
            other => tracing::debug!(exit = ?other, "polled stream finished"),
        }
        teardown.run_after_close(&writer).await;
    });

    Ok(sse_response(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_required() {
        let empty = ChannelsQuery {
            channels: Some(" , ".to_string()),
        };
        let err = requested_channels(&empty).expect_err("empty");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(requested_channels(&ChannelsQuery::default()).is_err());

        let query = ChannelsQuery {
            channels: Some("room.5,orders".to_string()),
        };
        assert_eq!(
            requested_channels(&query).expect("channels"),
            vec!["room.5", "orders"]
        );
    }

    #[tokio::test]
    async fn sse_response_carries_streaming_headers() {
        let (writer, body) = sse::channel();
        writer.close();
        let response = sse_response(body);
        assert_eq!(response.status(), StatusCode::OK);
        for (name, value) in RESPONSE_HEADERS {
            assert_eq!(
                response.headers().get(name).and_then(|v| v.to_str().ok()),
                Some(value)
            );
        }
    }
}
