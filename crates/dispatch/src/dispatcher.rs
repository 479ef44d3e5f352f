use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::envelope::{EndpointId, Envelope};
use crate::error::{DispatchError, DispatchResult};
use crate::receiver::Receiver;
use crate::registry::{Link, Registry};

/// Sending half of a registered endpoint.
#[async_trait]
pub trait Dispatch: Send + Sync {
    fn endpoint(&self) -> &EndpointId;

    /// Send `data` to `to`. An empty `kind` sends opaque data.
    async fn send(&self, to: &EndpointId, kind: &str, data: Value) -> DispatchResult<()>;

    /// Detach from the shared link. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens dispatchers on one transport backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Arc<dyn Dispatch>>;
}

pub struct Dispatcher<L: Link> {
    endpoint: EndpointId,
    key: u64,
    link: Arc<L>,
    registry: Arc<Registry<L>>,
    closed: AtomicBool,
}

impl<L: Link> Dispatcher<L> {
    pub(crate) fn new(
        endpoint: EndpointId,
        key: u64,
        link: Arc<L>,
        registry: Arc<Registry<L>>,
    ) -> Self {
        Self {
            endpoint,
            key,
            link,
            registry,
            closed: AtomicBool::new(false),
        }
    }

    /// Backend link shared with every other dispatcher for this endpoint.
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }
}

#[async_trait]
impl<L: Link> Dispatch for Dispatcher<L> {
    fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    async fn send(&self, to: &EndpointId, kind: &str, data: Value) -> DispatchResult<()> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        trace!(from = %self.endpoint, to = %to, kind, "dispatching envelope");
        let envelope = Envelope::new(self.endpoint.clone(), to.clone(), kind, data);
        self.link.send(envelope).await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.detach(&self.endpoint, self.key);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<L: Link> Drop for Dispatcher<L> {
    fn drop(&mut self) {
        self.close();
    }
}
