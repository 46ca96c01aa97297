//! Worker restart accounting and the Prometheus scrape endpoint.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Monotonic count of timeout-driven worker restarts.
///
/// Incremented exactly once per restart, in the router's timeout path.
/// Deaths for other reasons (spawn failure, external kill) are not counted.
pub struct RestartCounter {
    name: String,
    restarts: AtomicU64,
}

impl RestartCounter {
    /// `app_name` becomes the metric prefix: `<app>_hss_worker_restarts`.
    pub fn new(app_name: &str) -> Self {
        Self {
            name: format!("{}_hss_worker_restarts", app_name),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn increment(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the counter in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        format!(
            "# HELP {name} The total number of worker process restarts\n\
             # TYPE {name} counter\n\
             {name} {value}\n",
            name = self.name,
            value = self.value()
        )
    }
}

/// Small HTTP listener serving `GET /metrics`.
pub struct MetricsServer {
    bind_addr: SocketAddr,
    restarts: Arc<RestartCounter>,
}

impl MetricsServer {
    pub fn new(bind_addr: SocketAddr, restarts: Arc<RestartCounter>) -> Self {
        Self { bind_addr, restarts }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "metrics server listening");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let restarts = Arc::clone(&self.restarts);
                    tokio::spawn(async move {
                        if let Err(e) = serve_metrics_connection(stream, restarts).await {
                            debug!(addr = %addr, error = %e, "metrics connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept metrics connection");
                }
            }
        }
    }
}

async fn serve_metrics_connection<S>(
    stream: S,
    restarts: Arc<RestartCounter>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let restarts = Arc::clone(&restarts);
        async move { handle_metrics_request(req, restarts).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("metrics connection error: {}", e))?;

    Ok(())
}

async fn handle_metrics_request(
    req: Request<hyper::body::Incoming>,
    restarts: Arc<RestartCounter>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(restarts.render())))
            .expect("valid response with StatusCode enum and static header"),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("valid response with StatusCode enum"),
    };

    Ok(response)
}
