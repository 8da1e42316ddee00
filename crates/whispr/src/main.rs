use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use whispr_core::{
    bot,
    config::Config,
    graph::GraphStore,
    messaging::retry::RetryPolicy,
    router::{Router, RouterConfig},
    security::AdminGate,
};
use whispr_signal_cli::SignalCliTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    whispr_core::logging::init("whispr")?;

    let cfg = Config::load()?;
    run(cfg).await
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let store = Arc::new(
        GraphStore::open(&cfg.data_dir)
            .with_context(|| format!("opening data dir {}", cfg.data_dir.display()))?,
    );

    let signal = Arc::new(
        SignalCliTransport::spawn(&cfg.signal_cli_path, &cfg.signal_account, cfg.send_timeout)
            .with_context(|| format!("starting {}", cfg.signal_cli_path.display()))?,
    );

    let admins = AdminGate::new(cfg.admins.iter().cloned());
    if admins.is_empty() {
        tracing::warn!("no admins configured, admin commands are disabled");
    }

    tracing::info!(
        account = %cfg.signal_account,
        data_dir = %cfg.data_dir.display(),
        admins = admins.len(),
        known_users = store.known_users().await.len(),
        "whispr started"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let router = Router::new(
        store,
        signal.clone(),
        admins,
        RouterConfig {
            retry: RetryPolicy {
                retries: cfg.delivery_retries,
                delay: cfg.retry_delay,
            },
        },
    )
    .with_shutdown(shutdown.clone());

    let result = bot::run(signal.clone(), &router, shutdown).await;

    if let Err(e) = signal.shutdown().await {
        tracing::warn!("failed to stop signal-cli: {e}");
    }

    match result {
        Ok(()) => {
            tracing::info!("whispr stopped");
            Ok(())
        }
        Err(e) => {
            let stderr = signal.stderr_tail().await;
            if stderr.trim().is_empty() {
                Err(e).context("signal-cli transport lost")
            } else {
                Err(e).context(format!("signal-cli transport lost\nstderr (tail):\n{stderr}"))
            }
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("signal received, shutting down");
    token.cancel();
}
