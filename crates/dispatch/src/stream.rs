//! HTTP backend: envelopes are POSTed to `{base}/message` one at a time and
//! received over a server-sent event stream at `{base}/messages/{id}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Error as SourceError, Event, EventSource};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::dispatcher::{Connector, Dispatch, Dispatcher};
use crate::envelope::{
    EndpointId, Envelope, Listing, RouteAck, ShutdownNotice, LISTING, PING, PONG, SHUTDOWN,
};
use crate::error::{DispatchError, DispatchResult};
use crate::receiver::Receiver;
use crate::registry::{Inlet, Link, Registry};
use crate::session::{join_path, parse_base, Exit, DEFAULT_RETRY, READY_TIMEOUT};

#[derive(Clone)]
pub struct StreamConnector {
    base: Url,
    client: reqwest::Client,
    registry: Arc<Registry<StreamLink>>,
}

pub struct StreamLink {
    posts: mpsc::UnboundedSender<PendingPost>,
    listing: Arc<RwLock<Option<Listing>>>,
    shutdown: Arc<Notify>,
}

struct PendingPost {
    envelope: Envelope,
    done: oneshot::Sender<DispatchResult<u64>>,
}

impl StreamConnector {
    pub fn new(base: &str) -> DispatchResult<Self> {
        Self::with_client(base, reqwest::Client::new())
    }

    pub fn with_client(base: &str, client: reqwest::Client) -> DispatchResult<Self> {
        Ok(Self {
            base: parse_base(base)?,
            client,
            registry: Registry::new(),
        })
    }

    pub async fn connect(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Dispatcher<StreamLink>> {
        let events = join_path(&self.base, &["messages", endpoint.as_str()])?;
        let message = join_path(&self.base, &["message"])?;
        let client = self.client.clone();
        self.registry
            .attach(endpoint, receiver, |inlet| {
                StreamLink::open(client, events, message, inlet)
            })
            .await
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn open(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Arc<dyn Dispatch>> {
        Ok(Arc::new(self.connect(endpoint, receiver).await?))
    }
}

impl StreamLink {
    async fn open(
        client: reqwest::Client,
        events: Url,
        message: Url,
        inlet: Inlet,
    ) -> DispatchResult<Self> {
        let (posts_tx, posts_rx) = mpsc::unbounded_channel();
        tokio::spawn(post_loop(client.clone(), message, posts_rx));

        let listing = Arc::new(RwLock::new(None));
        let shutdown = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = oneshot::channel();
        let session = StreamSession {
            client,
            events,
            inlet,
            posts: posts_tx.clone(),
            listing: Arc::clone(&listing),
            shutdown: Arc::clone(&shutdown),
            ready: Some(ready_tx),
        };
        tokio::spawn(session.run());

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => Ok(Self {
                posts: posts_tx,
                listing,
                shutdown,
            }),
            Ok(Err(_)) => Err(DispatchError::Setup(
                "event stream ended before registering".into(),
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
impl Link for StreamLink {
    async fn send(&self, envelope: Envelope) -> DispatchResult<()> {
        let (done, reply) = oneshot::channel();
        self.posts
            .send(PendingPost { envelope, done })
            .map_err(|_| DispatchError::Closed)?;
        reply.await.map_err(|_| DispatchError::Closed)?.map(|_| ())
    }

    fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Posts queued envelopes strictly one after another.
async fn post_loop(client: reqwest::Client, url: Url, mut posts: mpsc::UnboundedReceiver<PendingPost>) {
    while let Some(post) = posts.recv().await {
        let result = post_envelope(&client, &url, &post.envelope).await;
        if let Err(err) = &result {
            debug!(to = %post.envelope.to, kind = %post.envelope.kind, error = %err, "post failed");
        }
        let _ = post.done.send(result);
    }
}

async fn post_envelope(client: &reqwest::Client, url: &Url, envelope: &Envelope) -> DispatchResult<u64> {
    let response = client
        .post(url.clone())
        .json(envelope)
        .send()
        .await
        .map_err(|err| DispatchError::Transport(err.to_string()))?;
    match response.status() {
        status if status.is_success() => {
            let ack: RouteAck = response
                .json()
                .await
                .map_err(|err| DispatchError::Transport(err.to_string()))?;
            Ok(ack.id)
        }
        StatusCode::NOT_FOUND => Err(DispatchError::NotFound(envelope.to.clone())),
        StatusCode::FORBIDDEN => {
            let body = response.text().await.unwrap_or_default();
            Err(DispatchError::Forbidden(body))
        }
        StatusCode::GATEWAY_TIMEOUT => Err(DispatchError::Timeout),
        status => Err(DispatchError::Transport(format!("relay responded {status}"))),
    }
}

struct StreamSession {
    client: reqwest::Client,
    events: Url,
    inlet: Inlet,
    posts: mpsc::UnboundedSender<PendingPost>,
    listing: Arc<RwLock<Option<Listing>>>,
    shutdown: Arc<Notify>,
    ready: Option<oneshot::Sender<()>>,
}

impl StreamSession {
    async fn run(mut self) {
        loop {
            match self.pump().await {
                Exit::Finished => break,
                Exit::Retry(delay) => {
                    info!(endpoint = %self.inlet.endpoint(), ?delay, "relay asked us to reconnect later");
                    tokio::select! {
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(endpoint = %self.inlet.endpoint(), "event stream finished");
    }

    async fn pump(&mut self) -> Exit {
        let mut source = match EventSource::new(self.client.get(self.events.clone())) {
            Ok(source) => source,
            Err(err) => {
                warn!(error = %err, "cannot build event stream request");
                return Exit::Finished;
            }
        };
        source.set_retry_policy(Box::new(Never));

        let mut retry = None;
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    source.close();
                    return Exit::Finished;
                }
                event = source.next() => match event {
                    Some(Ok(Event::Open)) => trace!(endpoint = %self.inlet.endpoint(), "event stream open"),
                    Some(Ok(Event::Message(message))) => {
                        if let Some(delay) = self.on_event(&message.event, &message.data, message.retry) {
                            retry = Some(delay);
                        }
                    }
                    Some(Err(SourceError::StreamEnded)) | None => {
                        source.close();
                        return retry.map(Exit::Retry).unwrap_or(Exit::Finished);
                    }
                    Some(Err(err)) => {
                        warn!(endpoint = %self.inlet.endpoint(), error = %err, "event stream failed");
                        source.close();
                        return retry.map(Exit::Retry).unwrap_or(Exit::Finished);
                    }
                },
            }
        }
    }

    /// Returns a reconnect delay when the relay announced a drain.
    fn on_event(&mut self, name: &str, data: &str, retry: Option<Duration>) -> Option<Duration> {
        if let Ok(envelope) = Envelope::from_json(data) {
            self.inlet.deliver(envelope);
            return None;
        }
        match name {
            PING => {
                let endpoint = self.inlet.endpoint().clone();
                let (done, _) = oneshot::channel();
                let pong = Envelope::new(endpoint.clone(), endpoint, PONG, Value::Null);
                let _ = self.posts.send(PendingPost { envelope: pong, done });
                None
            }
            LISTING => {
                match serde_json::from_str::<Listing>(data) {
                    Ok(listing) => {
                        debug!(peers = listing.peers.len(), "relay listing");
                        *self.listing.write() = Some(listing);
                        if let Some(ready) = self.ready.take() {
                            let _ = ready.send(());
                        }
                    }
                    Err(err) => warn!(error = %err, "malformed listing event"),
                }
                None
            }
            SHUTDOWN => {
                let notice = serde_json::from_str::<ShutdownNotice>(data).ok();
                let delay = retry
                    .or_else(|| notice.map(|notice| Duration::from_secs(notice.retry_after)))
                    .unwrap_or(DEFAULT_RETRY);
                Some(delay)
            }
            other => {
                debug!(event = other, "ignoring unrecognized relay event");
                None
            }
        }
    }
}
