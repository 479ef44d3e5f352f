use std::env;
use std::time::Duration;

use crate::lock::LockConfig;

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub lock_timeout: Duration,
    pub lock_resend_interval: Duration,
    pub lock_lease: Duration,
    pub negotiation_timeout: Duration,
    /// After the connection settles back to stable under a held lock, release
    /// the lock if the holder has not done so within this delay.
    pub settle_delay: Duration,
    /// Serialize negotiations through the distributed lock.
    pub locking: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5_000),
            lock_resend_interval: Duration::from_millis(1_000),
            lock_lease: Duration::from_millis(30_000),
            negotiation_timeout: Duration::from_millis(10_000),
            settle_delay: Duration::from_millis(2_000),
            locking: true,
        }
    }
}

impl NegotiationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout: millis("BEACH_LOCK_TIMEOUT_MS").unwrap_or(defaults.lock_timeout),
            lock_resend_interval: millis("BEACH_LOCK_RESEND_MS")
                .unwrap_or(defaults.lock_resend_interval),
            lock_lease: millis("BEACH_LOCK_LEASE_MS").unwrap_or(defaults.lock_lease),
            negotiation_timeout: millis("BEACH_NEGOTIATION_TIMEOUT_MS")
                .unwrap_or(defaults.negotiation_timeout),
            settle_delay: millis("BEACH_SETTLE_DELAY_MS").unwrap_or(defaults.settle_delay),
            locking: env::var("BEACH_NEGOTIATION_LOCKING")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.locking),
        }
    }

    pub fn unlocked() -> Self {
        Self {
            locking: false,
            ..Self::default()
        }
    }

    pub fn lock(&self) -> LockConfig {
        LockConfig {
            timeout: self.lock_timeout,
            resend_interval: self.lock_resend_interval,
            lease: self.lock_lease,
        }
    }
}

fn millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
}
