//! The HTTP surface (§6.1): a minimal `hyper` router with no business logic
//! of its own — every handler in [`routes`] parses its request, calls into
//! [`crate::restore::RestoreEngine`] or the job store, and serializes the
//! result. A single `service_fn` dispatches on method and path rather than
//! pulling in a full routing framework.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
pub use routes::AppState;

pub async fn run_http_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| crate::error::Error::Config(format!("invalid HTTP_ADDR: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP surface listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, std::convert::Infallible>(routes::dispatch(req, state).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP connection error: {}", e);
            }
        });
    }
}

pub type BoxBody = Full<Bytes>;
