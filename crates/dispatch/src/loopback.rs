//! In-process backend: sends are delivered synchronously, in call order.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::dispatcher::{Connector, Dispatch, Dispatcher};
use crate::envelope::{EndpointId, Envelope};
use crate::error::{DispatchError, DispatchResult};
use crate::receiver::Receiver;
use crate::registry::{Link, Registry};

#[derive(Clone)]
pub struct LoopbackNetwork {
    registry: Arc<Registry<LoopbackLink>>,
}

pub struct LoopbackLink {
    network: Weak<Registry<LoopbackLink>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub async fn connect(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Dispatcher<LoopbackLink>> {
        let network = Arc::downgrade(&self.registry);
        self.registry
            .attach(endpoint, receiver, |_inlet| async move {
                Ok(LoopbackLink { network })
            })
            .await
    }

    pub fn registry(&self) -> &Arc<Registry<LoopbackLink>> {
        &self.registry
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LoopbackNetwork {
    async fn open(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Arc<dyn Dispatch>> {
        Ok(Arc::new(self.connect(endpoint, receiver).await?))
    }
}

#[async_trait]
impl Link for LoopbackLink {
    async fn send(&self, envelope: Envelope) -> DispatchResult<()> {
        let network = self.network.upgrade().ok_or(DispatchError::Closed)?;
        match network.fan_out(&envelope) {
            Some(_) => Ok(()),
            None => Err(DispatchError::NotFound(envelope.to)),
        }
    }

    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ChannelReceiver;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_send_order() {
        let network = LoopbackNetwork::new();
        let (a_rx, _a_inbox) = ChannelReceiver::new(None);
        let (b_rx, mut b_inbox) = ChannelReceiver::new(Some("A1".into()));
        let a = network.connect("A1".into(), Arc::new(a_rx)).await.unwrap();
        let _b = network.connect("B2".into(), Arc::new(b_rx)).await.unwrap();

        for n in 0..50 {
            a.send(&"B2".into(), "note", json!(n)).await.unwrap();
        }
        for n in 0..50 {
            assert_eq!(b_inbox.recv().await.unwrap().data, json!(n));
        }
    }

    #[tokio::test]
    async fn unknown_destination_is_not_found() {
        let network = LoopbackNetwork::new();
        let (rx, _inbox) = ChannelReceiver::new(None);
        let a = network.connect("A1".into(), Arc::new(rx)).await.unwrap();
        let err = a.send(&"ghost".into(), "note", json!(null)).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(id) if id.as_str() == "ghost"));
    }

    #[tokio::test]
    async fn shared_endpoint_fans_out_and_survives_partial_close() {
        let network = LoopbackNetwork::new();
        let (first, mut first_inbox) = ChannelReceiver::new(None);
        let (second, mut second_inbox) = ChannelReceiver::new(None);
        let (sender, _sender_inbox) = ChannelReceiver::new(None);
        let b1 = network.connect("B2".into(), Arc::new(first)).await.unwrap();
        let b2 = network.connect("B2".into(), Arc::new(second)).await.unwrap();
        let a = network.connect("A1".into(), Arc::new(sender)).await.unwrap();
        assert_eq!(network.registry().member_count(&"B2".into()), 2);

        a.send(&"B2".into(), "note", json!(1)).await.unwrap();
        assert_eq!(first_inbox.recv().await.unwrap().data, json!(1));
        assert_eq!(second_inbox.recv().await.unwrap().data, json!(1));

        b1.close();
        b1.close();
        assert!(b1.is_closed());
        assert!(network.registry().contains(&"B2".into()));
        a.send(&"B2".into(), "note", json!(2)).await.unwrap();
        assert_eq!(second_inbox.recv().await.unwrap().data, json!(2));

        drop(b2);
        assert!(!network.registry().contains(&"B2".into()));
        assert!(a.send(&"B2".into(), "note", json!(3)).await.is_err());
    }

    #[tokio::test]
    async fn closed_dispatcher_rejects_sends() {
        let network = LoopbackNetwork::new();
        let (rx, _inbox) = ChannelReceiver::new(None);
        let a = network.connect("A1".into(), Arc::new(rx)).await.unwrap();
        a.close();
        let err = a.send(&"A1".into(), "note", json!(null)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
    }
}
