use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clipcache_core::{ClipCoordinator, HttpNvr, MetricsObserver};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod access_log;
mod api_clips;
mod api_meta;
mod app_state;
mod responses;
mod router;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    clipcache_otel::init();
    if let Err(err) = run().await {
        error!("clipcache server failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = clipcache_core::load_effective()?;
    let api = Arc::new(HttpNvr::new(&config.nvr).context("building recorder client")?);
    let metrics = Arc::new(MetricsObserver::new());
    let coordinator = ClipCoordinator::from_config(&config, api, metrics.clone()).await?;

    let scan = coordinator
        .retention()
        .scan_existing()
        .await
        .context("scanning cache directory")?;
    info!(
        root = %coordinator.root().display(),
        clips = scan.registered,
        bytes = scan.registered_bytes,
        "cache ready"
    );

    let shutdown = CancellationToken::new();
    let sweeper = coordinator.spawn_sweeper(config.cache.sweep_interval(), shutdown.clone());
    let app = router::build(AppState::new(coordinator, metrics));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, "clipcache listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), sweeper)
        .await
        .is_err()
    {
        warn!("cache sweeper did not stop in time");
    }
    served.context("http server exited with error")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
