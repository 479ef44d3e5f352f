//! In-process backend that delays every envelope by a random amount.
//! Delivery order across envelopes is not preserved.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::trace;

use crate::dispatcher::{Connector, Dispatch, Dispatcher};
use crate::envelope::{EndpointId, Envelope};
use crate::error::{DispatchError, DispatchResult};
use crate::receiver::Receiver;
use crate::registry::{Link, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::from_millis(25),
        }
    }
}

impl JitterConfig {
    fn sample(&self) -> Duration {
        let min = self.min_delay.as_micros() as u64;
        let max = (self.max_delay.as_micros() as u64).max(min);
        Duration::from_micros(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Clone)]
pub struct JitterNetwork {
    registry: Arc<Registry<JitterLink>>,
    config: JitterConfig,
}

pub struct JitterLink {
    network: Weak<Registry<JitterLink>>,
    config: JitterConfig,
}

impl JitterNetwork {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }

    pub async fn connect(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Dispatcher<JitterLink>> {
        let network = Arc::downgrade(&self.registry);
        let config = self.config;
        self.registry
            .attach(endpoint, receiver, |_inlet| async move {
                Ok(JitterLink { network, config })
            })
            .await
    }
}

impl Default for JitterNetwork {
    fn default() -> Self {
        Self::new(JitterConfig::default())
    }
}

#[async_trait]
impl Connector for JitterNetwork {
    async fn open(
        &self,
        endpoint: EndpointId,
        receiver: Arc<dyn Receiver>,
    ) -> DispatchResult<Arc<dyn Dispatch>> {
        Ok(Arc::new(self.connect(endpoint, receiver).await?))
    }
}

#[async_trait]
impl Link for JitterLink {
    async fn send(&self, envelope: Envelope) -> DispatchResult<()> {
        let network = self.network.upgrade().ok_or(DispatchError::Closed)?;
        if !network.contains(&envelope.to) {
            return Err(DispatchError::NotFound(envelope.to));
        }
        let delay = self.config.sample();
        let network = Weak::clone(&self.network);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(network) = network.upgrade() {
                if network.fan_out(&envelope).is_none() {
                    trace!(to = %envelope.to, "destination left before delayed delivery");
                }
            }
        });
        Ok(())
    }

    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ChannelReceiver;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn delivers_everything_eventually() {
        let network = JitterNetwork::new(JitterConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        });
        let (a_rx, _a_inbox) = ChannelReceiver::new(None);
        let (b_rx, mut b_inbox) = ChannelReceiver::new(None);
        let a = network.connect("A1".into(), Arc::new(a_rx)).await.unwrap();
        let _b = network.connect("B2".into(), Arc::new(b_rx)).await.unwrap();

        for n in 0..20u64 {
            a.send(&"B2".into(), "note", json!(n)).await.unwrap();
        }
        let mut seen = BTreeSet::new();
        while seen.len() < 20 {
            let inbound = b_inbox.recv().await.unwrap();
            seen.insert(inbound.data.as_u64().unwrap());
        }
        assert_eq!(seen, (0..20).collect());
    }

    #[tokio::test]
    async fn absent_destination_fails_immediately() {
        let network = JitterNetwork::default();
        let (rx, _inbox) = ChannelReceiver::new(None);
        let a = network.connect("A1".into(), Arc::new(rx)).await.unwrap();
        assert!(matches!(
            a.send(&"ghost".into(), "note", json!(null)).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[test]
    fn sample_stays_within_bounds() {
        let config = JitterConfig {
            min_delay: Duration::from_millis(3),
            max_delay: Duration::from_millis(5),
        };
        for _ in 0..100 {
            let delay = config.sample();
            assert!(delay >= config.min_delay && delay <= config.max_delay);
        }
    }
}
