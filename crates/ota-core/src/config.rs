use std::time::Duration;

use anyhow::anyhow;

use crate::{Address, TestPolicy};

/// Protocol timing and policy for one device, station or remote unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Own address, used as the sender of every outbound message.
    pub address: Address,
    /// Period at which a connected unit sends `PING`.
    pub ping_interval: Duration,
    /// Silence after which a connected session is considered lost.
    pub ping_timeout: Duration,
    /// Base delay between `REQ` retransmissions.
    pub connect_retry: Duration,
    /// Upper bound for the `REQ` retransmission backoff.
    pub connect_retry_max: Duration,
    /// Give up connecting after this many `REQ`s, `None` retries forever.
    pub max_connect_attempts: Option<u32>,
    /// Period of the keepalive and scheduling tick.
    pub tick: Duration,
    /// Minimum gap between two radio writes.
    pub send_spacing: Duration,
    pub test_policy: TestPolicy,
}

impl Config {
    pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
    /// Missed ping periods before a session is dropped.
    pub const PING_TIMEOUT_FACTOR: u32 = 3;

    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ping_interval: Self::DEFAULT_PING_INTERVAL,
            ping_timeout: Self::DEFAULT_PING_INTERVAL * Self::PING_TIMEOUT_FACTOR,
            connect_retry: Duration::from_secs(1),
            connect_retry_max: Duration::from_secs(30),
            max_connect_attempts: None,
            tick: Duration::from_secs(1),
            send_spacing: Duration::ZERO,
            test_policy: TestPolicy::default(),
        }
    }

    /// Sets the ping interval and derives the timeout from it.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = interval * Self::PING_TIMEOUT_FACTOR;
        self
    }

    #[must_use]
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_retry(mut self, base: Duration, max: Duration) -> Self {
        self.connect_retry = base;
        self.connect_retry_max = max;
        self
    }

    #[must_use]
    pub fn with_max_connect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    #[must_use]
    pub fn with_send_spacing(mut self, spacing: Duration) -> Self {
        self.send_spacing = spacing;
        self
    }

    #[must_use]
    pub fn with_test_policy(mut self, policy: TestPolicy) -> Self {
        self.test_policy = policy;
        self
    }

    /// Delay before `REQ` number `attempt + 1`: `connect_retry * 2^(attempt - 1)`,
    /// capped at `connect_retry_max`.
    #[must_use]
    pub fn connect_backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.connect_retry
            .saturating_mul(multiplier)
            .min(self.connect_retry_max)
    }

    /// # Errors
    ///
    /// If a timer is zero or the timeout does not exceed the ping interval.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.address.is_broadcast() {
            return Err(anyhow!("own address must not be the broadcast address"));
        }
        if self.tick.is_zero() || self.ping_interval.is_zero() || self.connect_retry.is_zero() {
            return Err(anyhow!("tick, ping interval and connect retry must be non-zero"));
        }
        if self.ping_timeout <= self.ping_interval {
            return Err(anyhow!(
                "ping timeout {:?} must exceed ping interval {:?}",
                self.ping_timeout,
                self.ping_interval
            ));
        }
        if self.test_policy.configuration_ids.is_empty() || self.test_policy.roles.is_empty() {
            return Err(anyhow!("test policy accepts no configuration"));
        }
        Ok(())
    }
}
