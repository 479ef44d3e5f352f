//! `GET /messages/:id`: the push half of the request/stream transport.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use beach_dispatch::envelope::{LISTING, PING, SHUTDOWN};
use beach_dispatch::{EndpointId, ShutdownNotice};
use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{ChannelMode, CloseReason, Deregister, Outbound};
use crate::state::RelayState;

/// Event name for envelopes without a type.
const DATA_EVENT: &str = "message";

type Feed = (mpsc::UnboundedReceiver<Outbound>, Option<Deregister>);

enum Rendered {
    Event(Event),
    /// Last event of the stream.
    Final(Event),
    Skip,
    End,
}

pub async fn stream_messages(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let endpoint = EndpointId::from(id);
    let ip = connect.map(|ConnectInfo(addr)| addr.ip().to_string());
    let feed: Feed = match state
        .registry
        .register(endpoint.clone(), ChannelMode::Stream, ip)
    {
        Ok(registration) => (registration.outbound, Some(registration.guard)),
        Err(err) => {
            debug!(endpoint = %endpoint, error = %err, "refusing event stream");
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(Outbound::Close(CloseReason::Draining {
                retry_after: state.config.retry_after_secs(),
            }));
            (rx, None)
        }
    };
    Sse::new(stream::unfold(Some(feed), next_event)).keep_alive(KeepAlive::default())
}

async fn next_event(feed: Option<Feed>) -> Option<(Result<Event, Infallible>, Option<Feed>)> {
    let (mut outbound, guard) = feed?;
    loop {
        match render(outbound.recv().await?) {
            Rendered::Event(event) => return Some((Ok(event), Some((outbound, guard)))),
            Rendered::Final(event) => return Some((Ok(event), None)),
            Rendered::Skip => continue,
            Rendered::End => return None,
        }
    }
}

fn render(outbound: Outbound) -> Rendered {
    match outbound {
        Outbound::Listing(listing) => {
            let data = serde_json::to_string(&listing).unwrap_or_else(|_| "{}".into());
            Rendered::Event(Event::default().event(LISTING).data(data))
        }
        Outbound::Envelope {
            number,
            envelope,
            ack,
        } => {
            let data = match envelope.to_json() {
                Ok(data) => data,
                Err(err) => {
                    warn!(to = %envelope.to, error = %err, "cannot encode envelope");
                    return Rendered::Skip;
                }
            };
            let name = if envelope.is_opaque() {
                DATA_EVENT
            } else {
                envelope.kind.as_str()
            };
            let event = Event::default()
                .event(name)
                .id(number.to_string())
                .data(data);
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
            Rendered::Event(event)
        }
        Outbound::Ping => Rendered::Event(Event::default().event(PING).data("{}")),
        Outbound::Close(CloseReason::Draining { retry_after }) => {
            let notice = ShutdownNotice {
                retry_after,
                reason: CloseReason::Draining { retry_after }.label().to_string(),
            };
            let data = serde_json::to_string(&notice).unwrap_or_else(|_| "{}".into());
            Rendered::Final(
                Event::default()
                    .event(SHUTDOWN)
                    .retry(Duration::from_secs(retry_after))
                    .data(data),
            )
        }
        Outbound::Close(reason) => {
            debug!(reason = reason.label(), "ending event stream");
            Rendered::End
        }
    }
}
