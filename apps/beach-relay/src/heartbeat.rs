use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};

use crate::registry::{CloseReason, EndpointRegistry, HeartbeatTick};

/// Probe every channel once; channels with too many unanswered probes are
/// closed and dropped from the registry. Returns the number evicted.
pub fn sweep(registry: &EndpointRegistry, max_missed: u32) -> usize {
    let mut evicted = 0;
    for channel in registry.channels() {
        if !channel.is_open() {
            continue;
        }
        match channel.tick_heartbeat(max_missed) {
            HeartbeatTick::Probe => {
                if !channel.probe() {
                    trace!(endpoint = %channel.endpoint(), "probe not queued; channel is closing");
                }
            }
            HeartbeatTick::Evict => {
                warn!(
                    endpoint = %channel.endpoint(),
                    channel = %channel.id(),
                    mode = channel.mode().as_str(),
                    "no pong from endpoint; evicting channel"
                );
                channel.close(CloseReason::Heartbeat);
                registry.remove(&channel);
                counter!("beach_relay_heartbeat_evictions_total", 1);
                evicted += 1;
            }
        }
    }
    evicted
}

pub fn spawn(registry: Arc<EndpointRegistry>, period: Duration, max_missed: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep(&registry, max_missed);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelMode, Outbound};

    #[test]
    fn silent_channel_is_evicted_after_two_periods() {
        let registry = EndpointRegistry::new();
        let mut quiet = registry
            .register("A1".into(), ChannelMode::Stream, None)
            .unwrap();
        let mut chatty = registry
            .register("B2".into(), ChannelMode::Socket, None)
            .unwrap();
        let _ = quiet.outbound.try_recv();
        let _ = chatty.outbound.try_recv();

        for _ in 0..2 {
            assert_eq!(sweep(&registry, 2), 0);
            assert!(matches!(quiet.outbound.try_recv(), Ok(Outbound::Ping)));
            assert!(matches!(chatty.outbound.try_recv(), Ok(Outbound::Ping)));
            registry.record_pong(&"B2".into());
        }

        assert_eq!(sweep(&registry, 2), 1);
        assert!(matches!(
            quiet.outbound.try_recv(),
            Ok(Outbound::Close(CloseReason::Heartbeat))
        ));
        assert!(!registry.contains(&"A1".into()));
        assert!(registry.contains(&"B2".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_task_probes_each_period() {
        let registry = EndpointRegistry::new();
        let mut a = registry
            .register("A1".into(), ChannelMode::Stream, None)
            .unwrap();
        let _ = a.outbound.try_recv();

        let task = spawn(Arc::clone(&registry), Duration::from_secs(30), 2);
        assert!(matches!(a.outbound.recv().await, Some(Outbound::Ping)));
        task.abort();
    }
}
