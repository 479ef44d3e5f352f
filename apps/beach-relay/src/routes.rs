use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use beach_dispatch::envelope::{LISTING, PONG};
use beach_dispatch::{Envelope, Listing, RouteAck};
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::ApiError;
use crate::socket::socket_upgrade;
use crate::state::RelayState;
use crate::stream::stream_messages;

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/peers", get(peers_handler))
        .route("/metrics", get(metrics_handler))
        .route("/message", post(post_message))
        .route("/messages/:id", get(stream_messages))
        .route("/:id", get(socket_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn peers_handler(
    State(state): State<Arc<RelayState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Json<Listing> {
    Json(state.registry.listing(client_ip(connect)))
}

async fn metrics_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

async fn post_message(
    State(state): State<Arc<RelayState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<RouteAck>, ApiError> {
    route_posted(&state, envelope, client_ip(connect))
        .await
        .map(Json)
}

/// Route a POSTed envelope and answer only once the destination channel has
/// taken the push, so one client's posts arrive in the order it sent them.
async fn route_posted(
    state: &RelayState,
    mut envelope: Envelope,
    ip: Option<String>,
) -> Result<RouteAck, ApiError> {
    match envelope.kind.as_str() {
        PONG => {
            if envelope.from != envelope.to {
                return Err(ApiError::Forbidden(format!(
                    "pong from {} cannot answer for {}",
                    envelope.from, envelope.to
                )));
            }
            return if state.registry.record_pong(&envelope.to) {
                Ok(RouteAck { id: 0 })
            } else {
                Err(ApiError::NotFound(envelope.to))
            };
        }
        LISTING => {
            let listing = state.registry.listing(ip);
            envelope.data = serde_json::to_value(listing).unwrap_or_default();
        }
        _ => {}
    }

    let to = envelope.to.clone();
    let (ack, acked) = oneshot::channel();
    let id = state.registry.route(envelope, Some(ack))?;
    match tokio::time::timeout(state.config.route_timeout, acked).await {
        Ok(Ok(())) => Ok(RouteAck { id }),
        Ok(Err(_)) => {
            debug!(to = %to, id, "destination closed before taking the push");
            Err(ApiError::NotFound(to))
        }
        Err(_) => Err(ApiError::Timeout(to)),
    }
}

fn client_ip(connect: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    connect.map(|ConnectInfo(addr)| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::registry::{ChannelMode, Outbound};
    use axum::body::{self, Body};
    use axum::http::{Request, StatusCode};
    use beach_dispatch::EndpointId;
    use serde_json::Value;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn state() -> Arc<RelayState> {
        Arc::new(RelayState::new(RelayConfig {
            route_timeout: Duration::from_millis(100),
            ..RelayConfig::default()
        }))
    }

    async fn post(state: &Arc<RelayState>, body: Value) -> (StatusCode, Value) {
        let response = router(Arc::clone(state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/message")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Registers `id` and acknowledges every push it receives.
    fn consume(state: &Arc<RelayState>, id: &str) -> tokio::sync::mpsc::UnboundedReceiver<Envelope> {
        let registration = state
            .registry
            .register(id.into(), ChannelMode::Stream, None)
            .unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut outbound = registration.outbound;
            let _guard = registration.guard;
            while let Some(item) = outbound.recv().await {
                if let Outbound::Envelope { envelope, ack, .. } = item {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    let _ = tx.send(envelope);
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = router(state())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ghost_destination_is_not_found() {
        let state = state();
        let (status, body) = post(
            &state,
            json!({"to": "ghost", "from": "A1", "type": "offer", "data": {}}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn routed_post_returns_the_message_number() {
        let state = state();
        let mut inbox = consume(&state, "B2");

        let (status, body) = post(&state, json!({"to": "B2", "from": "A1", "type": "offer"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"id": 1}));
        let (_, body) = post(&state, json!({"to": "B2", "from": "A1", "data": [1]})).await;
        assert_eq!(body, json!({"id": 2}));

        assert_eq!(inbox.recv().await.unwrap().kind, "offer");
        assert!(inbox.recv().await.unwrap().is_opaque());
    }

    #[tokio::test]
    async fn listing_requests_carry_the_live_snapshot() {
        let state = state();
        let mut inbox = consume(&state, "B2");
        let _a = consume(&state, "A1");

        let (status, _) = post(&state, json!({"to": "B2", "from": "A1", "type": "listing"})).await;
        assert_eq!(status, StatusCode::OK);
        let listing: Listing = serde_json::from_value(inbox.recv().await.unwrap().data).unwrap();
        assert_eq!(listing.peers, vec![EndpointId::new("A1"), EndpointId::new("B2")]);
    }

    #[tokio::test]
    async fn pong_must_come_from_the_probed_endpoint() {
        let state = state();
        let _a = consume(&state, "A1");

        let (status, body) = post(&state, json!({"to": "A1", "from": "B2", "type": "pong"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");

        let (status, _) = post(&state, json!({"to": "A1", "from": "A1", "type": "pong"})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post(&state, json!({"to": "C3", "from": "C3", "type": "pong"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unroutable_kinds_are_bad_requests() {
        let state = state();
        let _b = consume(&state, "B2");
        let (status, body) =
            post(&state, json!({"to": "B2", "from": "A1", "type": "offer\r\nevent: x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn unread_channel_times_out() {
        let state = state();
        let _stalled = state
            .registry
            .register("B2".into(), ChannelMode::Stream, None)
            .unwrap();
        let (status, body) = post(&state, json!({"to": "B2", "from": "A1", "type": "offer"})).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "timeout");
    }

    #[tokio::test]
    async fn peers_lists_registered_endpoints() {
        let state = state();
        let _a = consume(&state, "A1");
        let response = router(Arc::clone(&state))
            .oneshot(Request::builder().uri("/peers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let listing: Listing = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listing.peers, vec![EndpointId::new("A1")]);
        assert_eq!(listing.version, env!("CARGO_PKG_VERSION"));
    }
}
