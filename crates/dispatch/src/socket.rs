//! Websocket backend: one socket per endpoint at `{base}/{id}`, envelopes as
//! JSON text frames in both directions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::dispatcher::{Connector, Dispatch, Dispatcher};
use crate::envelope::{parse_retry_reason, EndpointId, Envelope, Listing};
use crate::error::{DispatchError, DispatchResult};
use crate::receiver::Receiver;
use crate::registry::{Inlet, Link, Registry};
use crate::session::{join_path, parse_base, Exit, READY_TIMEOUT};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct SocketConnector {
    base: Url,
    registry: Arc<Registry<SocketLink>>,
}

pub struct SocketLink {
    outbound: mpsc::UnboundedSender<String>,
    listing: Arc<RwLock<Option<Listing>>>,
    shutdown: Arc<Notify>,
}

impl SocketConnector {
    /// `base` may use ws(s) or http(s); http schemes are mapped to ws.
    pub fn new(base: &str) -> DispatchResult<Self> {
        let mut base = parse_base(base)?;
        let scheme = match base.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(DispatchError::Setup(format!(
                    "unsupported scheme {other} for websocket relay"
                )))
            }
        };
        base.set_scheme(scheme)
            .map_err(|_| DispatchError::Setup(format!("cannot use {scheme} for {base}")))?;
        Ok(Self {
            base,
            registry: Registry::new(),
        })
    }

    pub async fn connect(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Dispatcher<SocketLink>> {
        let url = join_path(&self.base, &[endpoint.as_str()])?;
        self.registry
            .attach(endpoint, receiver, |inlet| SocketLink::open(url, inlet))
            .await
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn open(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Arc<dyn Dispatch>> {
        Ok(Arc::new(self.connect(endpoint, receiver).await?))
    }
}

impl SocketLink {
    async fn open(url: Url, inlet: Inlet) -> DispatchResult<Self> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| DispatchError::Setup(format!("connect {url}: {err}")))?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let listing = Arc::new(RwLock::new(None));
        let shutdown = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = oneshot::channel();

        let session = SocketSession {
            url,
            inlet,
            outbound: outbound_rx,
            listing: Arc::clone(&listing),
            shutdown: Arc::clone(&shutdown),
            ready: Some(ready_tx),
        };
        tokio::spawn(session.run(ws));

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => Ok(Self {
                outbound: outbound_tx,
                listing,
                shutdown,
            }),
            Ok(Err(_)) => Err(DispatchError::Setup(
                "relay closed the socket before registering".into(),
            )),
            Err(_) => {
                shutdown.notify_one();
                Err(DispatchError::Timeout)
            }
        }
    }

    /// Most recent peer listing pushed by the relay.
    pub fn peers(&self) -> Option<Listing> {
        self.listing.read().clone()
    }
}

#[async_trait]
impl Link for SocketLink {
    async fn send(&self, envelope: Envelope) -> DispatchResult<()> {
        let text = envelope.to_json()?;
        self.outbound.send(text).map_err(|_| DispatchError::Closed)
    }

    fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

struct SocketSession {
    url: Url,
    inlet: Inlet,
    outbound: mpsc::UnboundedReceiver<String>,
    listing: Arc<RwLock<Option<Listing>>>,
    shutdown: Arc<Notify>,
    ready: Option<oneshot::Sender<()>>,
}

impl SocketSession {
    async fn run(mut self, mut ws: WsStream) {
        loop {
            match self.pump(ws).await {
                Exit::Finished => break,
                Exit::Retry(delay) => {
                    info!(endpoint = %self.inlet.endpoint(), ?delay, "relay asked us to reconnect later");
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match connect_async(self.url.as_str()).await {
                        Ok((next, _)) => ws = next,
                        Err(err) => {
                            warn!(endpoint = %self.inlet.endpoint(), error = %err, "socket reconnect failed");
                            break;
                        }
                    }
                }
            }
        }
        debug!(endpoint = %self.inlet.endpoint(), "socket session finished");
    }

    async fn pump(&mut self, ws: WsStream) -> Exit {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Exit::Finished;
                }
                outbound = self.outbound.recv() => match outbound {
                    Some(text) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!(endpoint = %self.inlet.endpoint(), error = %err, "socket write failed");
                            return Exit::Finished;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Exit::Finished;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_text(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.on_text(&text),
                        Err(_) => debug!("ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Ping(_))) => {
                        // flushes the queued pong
                        let _ = sink.flush().await;
                    }
                    Some(Ok(Message::Close(frame))) => return close_exit(frame),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(endpoint = %self.inlet.endpoint(), error = %err, "socket read failed");
                        return Exit::Finished;
                    }
                    None => return Exit::Finished,
                },
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        if let Ok(envelope) = Envelope::from_json(text) {
            self.inlet.deliver(envelope);
            return;
        }
        match serde_json::from_str::<Listing>(text) {
            Ok(listing) => {
                debug!(peers = listing.peers.len(), "relay listing");
                *self.listing.write() = Some(listing);
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(());
                }
            }
            Err(err) => warn!(error = %err, "unrecognized frame from relay"),
        }
    }
}

fn close_exit(frame: Option<CloseFrame<'static>>) -> Exit {
    let Some(frame) = frame else {
        return Exit::Finished;
    };
    if frame.code == CloseCode::Again {
        if let Some(secs) = parse_retry_reason(&frame.reason) {
            return Exit::Retry(Duration::from_secs(secs));
        }
    }
    info!(code = u16::from(frame.code), reason = %frame.reason, "relay closed socket");
    Exit::Finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn http_base_maps_to_ws() {
        let connector = SocketConnector::new("http://127.0.0.1:8090").unwrap();
        assert_eq!(connector.base.scheme(), "ws");
        assert!(SocketConnector::new("ftp://example.com").is_err());
    }

    #[test]
    fn retry_close_frames_schedule_reconnect() {
        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: Cow::Borrowed("retry-after=3"),
        };
        assert_eq!(close_exit(Some(frame)), Exit::Retry(Duration::from_secs(3)));

        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed("superseded"),
        };
        assert_eq!(close_exit(Some(frame)), Exit::Finished);
        assert_eq!(close_exit(None), Exit::Finished);
    }
}
