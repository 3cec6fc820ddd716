//! Snapshot & Restore Orchestration Core — process entry point.
//!
//! Wires the cloud client, session provider, and job store into the two
//! long-running workflows (the snapshot worker and the HTTP restore
//! surface) plus the health and metrics servers, then runs them
//! concurrently until one exits.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use snapstor_core::cloud::{CloudClient, RetryPolicy};
use snapstor_core::config::Config;
use snapstor_core::domain::publisher::LoggingEventPublisher;
use snapstor_core::error::Result;
use snapstor_core::http::{self, AppState};
use snapstor_core::restore::RestoreEngine;
use snapstor_core::session::credentials;
use snapstor_core::session::SessionProvider;
use snapstor_core::snapshot::SnapshotWorker;
use snapstor_core::store::PostgresJobStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(&config);

    info!("starting snapshot & restore orchestration core");

    let store: Arc<dyn snapstor_core::domain::ports::JobStoreApi> =
        Arc::new(PostgresJobStore::connect(&config.database_url, config.database_max_connections).await?);

    let cloud: Arc<dyn snapstor_core::domain::ports::CloudApi> =
        Arc::new(CloudClient::new(config.cloud_endpoints(), RetryPolicy::default())?);

    let credentials = credentials::resolve(
        config.snapshot_service_user_disabled,
        config.snapshot_service_user_email.as_deref(),
        config.snapshot_service_user_password.as_deref(),
        config.snapshot_user_password_encrypted.as_deref(),
        config.snapshot_password_key.as_deref(),
    )?;
    let session_provider: Arc<dyn snapstor_core::domain::ports::SessionProviderApi> =
        Arc::new(SessionProvider::new(Arc::clone(&cloud), credentials));

    let events = Arc::new(LoggingEventPublisher::info_level());

    let restore_engine = Arc::new(RestoreEngine::new(
        Arc::clone(&cloud),
        Arc::clone(&session_provider),
        Arc::clone(&store),
        events.clone(),
        config.restore_cleanup_volumes,
    ));

    let snapshot_worker = Arc::new(SnapshotWorker::new(
        Arc::clone(&cloud),
        Arc::clone(&session_provider),
        Arc::clone(&store),
        events.clone(),
        config.policy_rules_path.clone(),
        config.policy_assign_interval(),
        config.auto_snapshot_interval(),
        config.auto_snapshot_max_size_gb,
        config.auto_snapshot_dry_run,
    ));

    let app_state = Arc::new(AppState {
        restore_engine,
        store: Arc::clone(&store),
        cloud: Arc::clone(&cloud),
        session_provider: Arc::clone(&session_provider),
        restore_enabled: config.restore_enabled,
    });

    let http_addr = config.http_addr.clone();
    let health_addr = config.health_addr.clone();
    let metrics_addr = config.metrics_addr.clone();

    let http_task = tokio::spawn(async move { http::run_http_server(&http_addr, app_state).await });
    let health_task = tokio::spawn(async move { run_health_server(&health_addr).await });
    let metrics_task = tokio::spawn(async move { run_metrics_server(&metrics_addr).await });
    let worker_task = tokio::spawn(async move { snapshot_worker.run_forever().await });

    tokio::select! {
        res = http_task => log_exit("http surface", res),
        res = health_task => log_exit("health server", res),
        res = metrics_task => log_exit("metrics server", res),
        res = worker_task => log_exit("snapshot worker", res),
    }

    Ok(())
}

fn log_exit(name: &str, res: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => error!("{name} exited cleanly, which should never happen for a supervised loop"),
        Ok(Err(e)) => error!(error = %e, "{name} exited with an error"),
        Err(e) => error!(error = %e, "{name} task panicked"),
    }
}

fn init_logging(config: &Config) {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("sqlx=warn".parse().unwrap());

    if config.log_json {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(true)).init();
    }
}

async fn run_health_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use snapstor_core::error::Error;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => {
                Response::builder().status(StatusCode::OK).body(Full::new(Bytes::from("ok"))).unwrap()
            }
            _ => Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::from("not found"))).unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().map_err(|e| Error::Config(format!("invalid health server address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!("health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service_fn(health_handler)).await {
                tracing::error!("health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use snapstor_core::error::Error;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            _ => Response::builder().status(StatusCode::NOT_FOUND).body(Full::new(Bytes::from("not found"))).unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().map_err(|e| Error::Config(format!("invalid metrics server address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!("metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service_fn(metrics_handler)).await {
                tracing::error!("metrics server connection error: {}", e);
            }
        });
    }
}
