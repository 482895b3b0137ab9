use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use cap_media_server::{
    app_state::AppState,
    config::{self, Args},
    job::JobRegistry,
    process_pool::ProcessPool,
    server, tracing as app_tracing,
};

#[tokio::main]
async fn main() {
    if let Ok(path) = dotenv() {
        eprintln!("loaded env variables from {}", path.display());
    }

    Args::parse().apply();
    app_tracing::init_tracer();

    if let Err(e) = cap_media_server::utils::ensure_scratch_dir().await {
        tracing::error!("failed to create scratch directory: {e}");
        return;
    }

    let pool: &'static ProcessPool = Box::leak(Box::new(ProcessPool::new()));
    let jobs: &'static JobRegistry = Box::leak(Box::new(JobRegistry::new()));
    let http = reqwest::Client::new();

    let state = AppState {
        pool,
        jobs,
        http,
        started_at: time::OffsetDateTime::now_utc(),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cap_media_server::job::run_sweeper(jobs, cancel.clone()));

    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let app = server::router(state).layer(cors);

    let port = config::settings().port();
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind port {port}: {e}");
            return;
        }
    };
    tracing::info!("listening on {addr}");

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
                .unwrap();
        });
    }

    wait_for_shutdown_signal(&cancel).await;
    tracing::info!("shutting down");
}

/// Waits for SIGINT, SIGTERM, or SIGHUP — container orchestrators that reload via
/// hangup rather than term need SIGHUP honored too.
async fn wait_for_shutdown_signal(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
            _ = cancel.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = cancel.cancelled() => {}
        }
    }
    cancel.cancel();
}
