use std::time::Duration;

use tokio::time::sleep;

use crate::{
    domain::UserId,
    messaging::{port::Transport, types::OutboundMessage},
};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub retries: u32,
    /// Pause between attempts (zero means retry immediately).
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::ZERO,
        }
    }
}

/// Result of delivering one message under a [`RetryPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Gave up after this many attempts.
    FailedAfterRetries(u32),
}

/// Per-recipient outcome of a fan-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: Vec<UserId>,
    pub failed: Vec<(UserId, u32)>,
}

impl FanoutReport {
    pub fn record(&mut self, recipient: UserId, outcome: Delivery) {
        match outcome {
            Delivery::Delivered => self.delivered.push(recipient),
            Delivery::FailedAfterRetries(attempts) => self.failed.push((recipient, attempts)),
        }
    }

    pub fn failed_ids(&self) -> Vec<UserId> {
        self.failed.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Send `msg`, retrying transport failures up to `policy.retries` times.
pub async fn send_with_retry(
    transport: &dyn Transport,
    msg: &OutboundMessage,
    policy: RetryPolicy,
) -> Delivery {
    let max_attempts = policy.retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match transport.send(msg).await {
            Ok(()) => return Delivery::Delivered,
            Err(e) => e,
        };

        if attempt >= max_attempts {
            tracing::warn!(
                recipient = %msg.recipient,
                correlation = msg.correlation_id.as_deref().unwrap_or("-"),
                attempts = attempt,
                "delivery permanently failed: {err}"
            );
            return Delivery::FailedAfterRetries(attempt);
        }

        tracing::debug!(
            recipient = %msg.recipient,
            attempt,
            "delivery failed, retrying: {err}"
        );
        if !policy.delay.is_zero() {
            sleep(policy.delay).await;
        }
    }
}
