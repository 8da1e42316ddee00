//! The worker loop: one envelope at a time, in arrival order.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{errors::Error, messaging::port::Transport, router::Router, Result};

/// Receive and handle envelopes until shutdown is requested or the
/// transport goes away.
///
/// Returns `Ok(())` on requested shutdown and `Err(TransportClosed)` (or the
/// underlying error) when the transport is lost. Malformed envelopes are
/// logged and skipped. An envelope already being handled always finishes,
/// including its fan-out.
pub async fn run(
    transport: Arc<dyn Transport>,
    router: &Router,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!("worker loop started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested, worker loop stopping");
                return Ok(());
            }
            next = transport.receive() => next,
        };

        match next {
            Ok(Some(envelope)) => {
                router.handle(&envelope).await;
            }
            Ok(None) => {
                tracing::error!("transport closed");
                return Err(Error::TransportClosed("inbound stream ended".to_string()));
            }
            Err(Error::MalformedEnvelope(reason)) => {
                tracing::warn!("skipping malformed envelope: {reason}");
            }
            Err(e) => {
                tracing::error!("transport failed: {e}");
                return Err(e);
            }
        }
    }
}
