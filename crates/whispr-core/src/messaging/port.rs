use async_trait::async_trait;

use crate::{
    messaging::types::{Envelope, OutboundMessage},
    Result,
};

/// Duplex channel to the external messaging client.
///
/// signal-cli is the production implementation; tests substitute recording
/// doubles. Implementations must serialize `send` so at most one outbound
/// request is in flight.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next inbound envelope.
    ///
    /// `Err(Error::MalformedEnvelope)` is per-line and non-fatal; the caller
    /// logs it and keeps reading. `Ok(None)` means the channel is gone.
    async fn receive(&self) -> Result<Option<Envelope>>;

    /// Deliver one message and wait for the client's acknowledgment.
    ///
    /// Never retries; failures come back as `Error::DeliveryFailed`.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;
}
