use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::dispatcher::Dispatcher;
use crate::envelope::{EndpointId, Envelope};
use crate::error::DispatchResult;
use crate::receiver::{deliver, Receiver};

/// Transport link shared by every dispatcher registered under one endpoint.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn send(&self, envelope: Envelope) -> DispatchResult<()>;

    /// Called once, after the last dispatcher for the endpoint closed.
    fn shutdown(&self);
}

pub(crate) trait Fanout: Send + Sync {
    fn fan_out(&self, envelope: &Envelope) -> Option<usize>;
}

/// Handle a link uses to push inbound envelopes for its endpoint.
#[derive(Clone)]
pub struct Inlet {
    endpoint: EndpointId,
    registry: Weak<dyn Fanout>,
}

impl Inlet {
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// Deliver to every receiver attached under this inlet's endpoint.
    /// Envelopes addressed elsewhere are dropped.
    pub fn deliver(&self, envelope: Envelope) -> usize {
        if envelope.to != self.endpoint {
            trace!(endpoint = %self.endpoint, to = %envelope.to, "dropping misaddressed envelope");
            return 0;
        }
        self.registry
            .upgrade()
            .and_then(|registry| registry.fan_out(&envelope))
            .unwrap_or(0)
    }
}

struct Member {
    key: u64,
    receiver: Arc<dyn Receiver>,
}

struct Slot<L> {
    link: Arc<OnceCell<Arc<L>>>,
    members: Vec<Member>,
}

/// Per-endpoint link sharing: every dispatcher opened for the same id rides
/// one link, and the link is shut down when the last of them closes.
pub struct Registry<L> {
    slots: Mutex<HashMap<EndpointId, Slot<L>>>,
    next_key: AtomicU64,
}

impl<L: Link> Registry<L> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
        })
    }

    /// Attach `receiver` under `endpoint`, creating the link with `connect`
    /// when this is the first dispatcher for that id.
    pub async fn attach<F, Fut>(
        self: &Arc<Self>,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
        connect: F,
    ) -> DispatchResult<Dispatcher<L>>
    where
        F: FnOnce(Inlet) -> Fut,
        Fut: Future<Output = DispatchResult<L>>,
    {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let cell = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(endpoint.clone()).or_insert_with(|| Slot {
                link: Arc::new(OnceCell::new()),
                members: Vec::new(),
            });
            slot.members.push(Member { key, receiver });
            Arc::clone(&slot.link)
        };

        let inlet = self.inlet(&endpoint);
        let link = match cell
            .get_or_try_init(|| async move { connect(inlet).await.map(Arc::new) })
            .await
        {
            Ok(link) => Arc::clone(link),
            Err(err) => {
                debug!(endpoint = %endpoint, error = %err, "link setup failed");
                self.detach(&endpoint, key);
                return Err(err);
            }
        };

        Ok(Dispatcher::new(endpoint, key, link, Arc::clone(self)))
    }

    pub fn contains(&self, endpoint: &EndpointId) -> bool {
        self.slots.lock().contains_key(endpoint)
    }

    pub fn member_count(&self, endpoint: &EndpointId) -> usize {
        self.slots
            .lock()
            .get(endpoint)
            .map(|slot| slot.members.len())
            .unwrap_or(0)
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut endpoints: Vec<_> = self.slots.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Deliver `envelope` to the members registered under its destination.
    /// `None` means nothing is registered there.
    pub fn fan_out(&self, envelope: &Envelope) -> Option<usize> {
        let receivers: Vec<Arc<dyn Receiver>> = {
            let slots = self.slots.lock();
            let slot = slots.get(&envelope.to)?;
            slot.members
                .iter()
                .map(|member| Arc::clone(&member.receiver))
                .collect()
        };
        Some(
            receivers
                .iter()
                .filter(|receiver| deliver(receiver.as_ref(), envelope))
                .count(),
        )
    }

    pub(crate) fn detach(&self, endpoint: &EndpointId, key: u64) {
        let emptied = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(endpoint) else {
                return;
            };
            slot.members.retain(|member| member.key != key);
            if slot.members.is_empty() {
                slots.remove(endpoint)
            } else {
                None
            }
        };
        if let Some(slot) = emptied {
            if let Some(link) = slot.link.get() {
                debug!(endpoint = %endpoint, "last dispatcher closed; shutting link down");
                link.shutdown();
            }
        }
    }

    fn inlet(self: &Arc<Self>, endpoint: &EndpointId) -> Inlet {
        let fanout: Arc<dyn Fanout> = self.clone();
        Inlet {
            endpoint: endpoint.clone(),
            registry: Arc::downgrade(&fanout),
        }
    }
}

impl<L: Link> Fanout for Registry<L> {
    fn fan_out(&self, envelope: &Envelope) -> Option<usize> {
        Registry::fan_out(self, envelope)
    }
}
