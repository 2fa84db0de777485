use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tributary::config::Options;
use tributary::fetch::{EngineOptions, FetchEngine};
use tributary::server::{self, AppState};
use tributary::store::Store;

// The engine's own drain timeout is 60 seconds; give the task a little
// extra before abandoning it.
const SHUTDOWN_CAP: Duration = Duration::from_secs(90);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Store::open(&options.db, options.dedupe)
        .await
        .context("opening database")?;

    let (engine, fetch) =
        FetchEngine::new(store.clone(), EngineOptions::default()).context("building engine")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // The engine owns the store's lifecycle: its run() does not return
    // until the fleet has drained and the store is closed.
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));

    let state = AppState {
        store,
        fetch,
        client: reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building http client")?,
    };
    let app = server::router(state, options.static_dir.as_ref());

    let listener = TcpListener::bind((options.host.as_str(), options.port))
        .await
        .with_context(|| format!("binding {}:{}", options.host, options.port))?;
    tracing::info!(host = options.host, port = options.port, "listening");

    let served = server::serve(listener, app, shutdown_rx).await;
    if let Err(error) = &served {
        tracing::error!(%error, "server stopped serving");
    }

    // Whether the server stopped by signal or by error, wind the engine
    // down before exiting.
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(SHUTDOWN_CAP, engine_task).await {
        Ok(joined) => joined.context("fetch engine panicked")?,
        Err(_) => tracing::error!("fetch engine did not shut down in time"),
    }

    served?;
    tracing::info!("exited cleanly");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
