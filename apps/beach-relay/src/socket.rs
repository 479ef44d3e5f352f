//! `/:id`: full-duplex websocket channel carrying JSON envelopes.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::response::Response;
use beach_dispatch::envelope::{retry_reason, LISTING, PONG};
use beach_dispatch::{EndpointId, Envelope};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::registry::{CloseReason, ChannelMode, Outbound, Registration};
use crate::state::RelayState;

pub async fn socket_upgrade(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let endpoint = EndpointId::from(id);
    let ip = connect.map(|ConnectInfo(addr)| addr.ip().to_string());
    ws.on_upgrade(move |socket| serve_socket(socket, state, endpoint, ip))
}

async fn serve_socket(socket: WebSocket, state: Arc<RelayState>, endpoint: EndpointId, ip: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let Registration {
        channel,
        mut outbound,
        guard,
    } = match state
        .registry
        .register(endpoint.clone(), ChannelMode::Socket, ip.clone())
    {
        Ok(registration) => registration,
        Err(err) => {
            debug!(endpoint = %endpoint, error = %err, "refusing socket");
            let reason = CloseReason::Draining {
                retry_after: state.config.retry_after_secs(),
            };
            let _ = sink.send(close_message(reason)).await;
            return;
        }
    };

    let writer_endpoint = endpoint.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let (message, ack, last) = match item {
                Outbound::Listing(listing) => match serde_json::to_string(&listing) {
                    Ok(text) => (Message::Text(text), None, false),
                    Err(err) => {
                        warn!(error = %err, "cannot encode listing");
                        continue;
                    }
                },
                Outbound::Envelope { envelope, ack, .. } => match envelope.to_json() {
                    Ok(text) => (Message::Text(text), ack, false),
                    Err(err) => {
                        warn!(to = %envelope.to, error = %err, "cannot encode envelope");
                        continue;
                    }
                },
                Outbound::Ping => (Message::Ping(Vec::new()), None, false),
                Outbound::Close(reason) => (close_message(reason), None, true),
            };
            if let Err(err) = sink.send(message).await {
                debug!(endpoint = %writer_endpoint, error = %err, "socket write failed");
                break;
            }
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
            if last {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(reason) = on_frame(&state, &endpoint, ip.as_deref(), &text) {
                        channel.close(reason);
                    }
                }
                Some(Ok(Message::Pong(_))) => channel.record_pong(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        endpoint = %endpoint,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed socket"
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(endpoint = %endpoint, error = %err, "socket read failed");
                    break;
                }
                None => break,
            },
        }
    }

    drop(guard);
    writer.abort();
    info!(endpoint = %endpoint, channel = %channel.id(), "socket closed");
}

/// Route one text frame from `endpoint`. An `Err` names why the socket must
/// be terminated.
fn on_frame(
    state: &RelayState,
    endpoint: &EndpointId,
    ip: Option<&str>,
    text: &str,
) -> Result<(), CloseReason> {
    let mut envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(endpoint = %endpoint, error = %err, "ignoring malformed frame");
            return Ok(());
        }
    };
    if envelope.from != *endpoint {
        counter!("beach_relay_identity_violations_total", 1);
        warn!(endpoint = %endpoint, claimed = %envelope.from, "socket sent a forged from");
        return Err(CloseReason::Identity);
    }

    match envelope.kind.as_str() {
        PONG => {
            state.registry.record_pong(endpoint);
            return Ok(());
        }
        LISTING => {
            let listing = state.registry.listing(ip.map(str::to_string));
            envelope.data = serde_json::to_value(listing).unwrap_or_default();
        }
        _ => {}
    }

    match state.registry.route(envelope, None) {
        Ok(_) => Ok(()),
        Err(RelayError::NotFound(to)) => {
            warn!(endpoint = %endpoint, to = %to, "socket addressed an unregistered endpoint");
            Err(CloseReason::Unroutable)
        }
        Err(err) => {
            debug!(endpoint = %endpoint, error = %err, "dropping frame");
            Ok(())
        }
    }
}

fn close_message(reason: CloseReason) -> Message {
    let (code, text) = match reason {
        CloseReason::Draining { retry_after } => (close_code::AGAIN, retry_reason(retry_after)),
        CloseReason::Heartbeat => (close_code::AWAY, reason.label().to_string()),
        CloseReason::Superseded | CloseReason::Identity | CloseReason::Unroutable => {
            (close_code::POLICY, reason.label().to_string())
        }
    };
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Owned(text),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use beach_dispatch::Listing;
    use serde_json::json;

    fn frame(from: &str, to: &str, kind: &str) -> String {
        Envelope::new(from.into(), to.into(), kind, json!({}))
            .to_json()
            .unwrap()
    }

    #[test]
    fn forged_and_unroutable_frames_terminate() {
        let state = RelayState::new(RelayConfig::default());
        let _b = state
            .registry
            .register("B2".into(), ChannelMode::Stream, None)
            .unwrap();
        let me = EndpointId::new("A1");

        assert_eq!(on_frame(&state, &me, None, &frame("A1", "B2", "offer")), Ok(()));
        assert_eq!(
            on_frame(&state, &me, None, &frame("B2", "A1", "offer")),
            Err(CloseReason::Identity)
        );
        assert_eq!(
            on_frame(&state, &me, None, &frame("A1", "ghost", "offer")),
            Err(CloseReason::Unroutable)
        );
        assert_eq!(on_frame(&state, &me, None, "not json"), Ok(()));
    }

    #[tokio::test]
    async fn listing_request_carries_the_socket_address() {
        let state = RelayState::new(RelayConfig::default());
        let mut registration = state
            .registry
            .register("A1".into(), ChannelMode::Socket, Some("10.0.0.7".into()))
            .unwrap();
        assert!(matches!(
            registration.outbound.recv().await,
            Some(Outbound::Listing(_))
        ));
        let me = EndpointId::new("A1");

        assert_eq!(
            on_frame(&state, &me, Some("10.0.0.7"), &frame("A1", "A1", LISTING)),
            Ok(())
        );
        match registration.outbound.recv().await {
            Some(Outbound::Envelope { envelope, .. }) => {
                let listing: Listing = serde_json::from_value(envelope.data).unwrap();
                assert_eq!(listing.ip.as_deref(), Some("10.0.0.7"));
                assert_eq!(listing.peers, vec![me]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn draining_close_carries_the_retry_hint() {
        match close_message(CloseReason::Draining { retry_after: 4 }) {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::AGAIN);
                assert_eq!(frame.reason, "retry-after=4");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
