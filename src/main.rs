use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use pushserver::batcher::{Batcher, BatcherConfig};
use pushserver::{config, fcm, handlers, ourcloud, store};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let oc_client = Arc::new(ourcloud::OurCloudClient::new(
        cfg.ourcloud.grpc_address.clone(),
    ));
    oc_client
        .connect()
        .await
        .context("failed to connect to OurCloud node")?;

    let store = Arc::new(
        store::Store::open(&cfg.batch.storage_path)
            .await
            .context("failed to initialize store")?,
    );
    info!(path = %cfg.batch.storage_path, "initialized store");

    let sender = Arc::new(
        fcm::FcmSender::new(
            Path::new(&cfg.firebase.credentials_file),
            &cfg.firebase.project_id,
        )
        .context("failed to initialize FCM sender")?,
    );
    info!("initialized FCM sender");

    let batcher = Batcher::new(
        Arc::clone(&store),
        sender,
        BatcherConfig {
            batch_window: cfg.batch_window(),
            max_batch_size: cfg.batch.max_size,
            lock_timeout: cfg.lock_timeout(),
            status_retention: cfg.status_retention(),
        },
    );

    // Re-drive anything a previous process left on disk before the
    // listener opens.
    batcher
        .recover()
        .await
        .context("failed to recover batches")?;

    let shutdown = CancellationToken::new();
    spawn_status_cleanup(Arc::clone(&store), shutdown.clone());

    let state = handlers::AppState {
        ourcloud: oc_client.clone(),
        batcher: Arc::clone(&batcher),
    };
    let app = handlers::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(cfg.read_timeout() + cfg.write_timeout()));

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(port = cfg.server.port, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    info!("shutting down");
    batcher.stop();
    store.close().await;
    oc_client.close().await;
    info!("server stopped");
    Ok(())
}

/// Hourly sweep of expired status rows, until shutdown.
fn spawn_status_cleanup(store: Arc<store::Store>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        // interval fires immediately; the first sweep should wait an hour
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => match store.cleanup_expired_status().await {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, "cleaned up expired status records"),
                    Err(err) => warn!(?err, "status cleanup failed"),
                },
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

/// Resolves on SIGINT or SIGTERM, cancelling `shutdown` so background tasks
/// exit while the listener drains.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    shutdown.cancel();
}
