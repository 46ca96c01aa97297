use crate::error::worker_error_response;
use crate::metrics::RestartCounter;
use crate::pool::WorkerPool;
use crate::registry::PortRegistry;
use crate::worker::Worker;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Response header carrying the pid of the worker that handled the request.
const X_WORKER: &str = "x-worker";

/// How long a dial to a worker may take before the attempt fails.
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP keep-alive interval on worker connections.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Binds each request to a worker and shepherds it through the proxy.
///
/// One instance serves the whole process; it owns the upstream HTTP client
/// and the deadline policy, and is the only place workers are cancelled.
pub struct Director {
    pool: Arc<WorkerPool>,
    registry: Arc<PortRegistry>,
    restarts: Arc<RestartCounter>,
    client: Client<HttpConnector, Incoming>,
    default_timeout: Duration,
    timeout_header: Option<HeaderName>,
}

impl Director {
    /// `timeout_header` is the configured override header name; an empty
    /// string disables per-request overrides.
    pub fn new(
        pool: Arc<WorkerPool>,
        registry: Arc<PortRegistry>,
        restarts: Arc<RestartCounter>,
        default_timeout: Duration,
        timeout_header: &str,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        connector.set_keepalive(Some(KEEP_ALIVE));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        let timeout_header = if timeout_header.is_empty() {
            None
        } else {
            HeaderName::from_bytes(timeout_header.as_bytes()).ok()
        };

        Self {
            pool,
            registry,
            restarts,
            client,
            default_timeout,
            timeout_header,
        }
    }

    /// The deadline for one request: the override header if configured and
    /// parseable as a duration, else the default. Parse failures are silent.
    fn effective_timeout(&self, headers: &HeaderMap) -> Duration {
        let Some(name) = &self.timeout_header else {
            return self.default_timeout;
        };
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| humantime::parse_duration(value).ok())
            .unwrap_or(self.default_timeout)
    }

    /// The worker to charge for a response or error on `port`. The registry
    /// entry is authoritative; the acquired handle is the fallback for the
    /// window before a respawned worker overwrites it.
    fn worker_for_port(&self, port: u16, acquired: &Arc<Worker>) -> Arc<Worker> {
        self.registry.get(port).unwrap_or_else(|| Arc::clone(acquired))
    }
}

/// The front-facing HTTP server.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    director: Arc<Director>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, director: Arc<Director>) -> Self {
        Self { bind_addr, director }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "stabilizer listening");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let director = Arc::clone(&self.director);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, director).await {
                            debug!(addr = %addr, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}

async fn serve_connection<S>(stream: S, director: Arc<Director>) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let director = Arc::clone(&director);
        async move { handle_request(req, director).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

/// Route one request: pick a worker, rewrite the target, forward under the
/// effective deadline, and settle the worker's admission slot afterwards.
///
/// A worker that blows the deadline is cancelled; its supervisor will
/// respawn it. All failures come back as 503 with the shared error code.
async fn handle_request(
    req: Request<Incoming>,
    director: Arc<Director>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let timeout = director.effective_timeout(req.headers());

    let worker = director.pool.acquire().await;
    let port = worker.port();

    debug!(method = %req.method(), uri = %req.uri(), pid = worker.pid(), port, "request");

    let outbound = match rewrite_request(req, port) {
        Ok(outbound) => outbound,
        Err(e) => {
            // The inbound request was already parsed, so this is effectively
            // unreachable; settle the slot and answer like a transport error.
            director.pool.release(Arc::clone(&worker));
            error!(pid = worker.pid(), error = %e, "rewriting request");
            return Ok(worker_error_response(worker.pid(), &e.to_string()));
        }
    };

    let result = tokio::time::timeout(timeout, director.client.request(outbound)).await;

    match result {
        Ok(Ok(response)) => {
            let served_by = director.worker_for_port(port, &worker);
            director.pool.release(Arc::clone(&served_by));

            let (mut parts, body) = response.into_parts();
            parts.headers.insert(X_WORKER, HeaderValue::from(served_by.pid()));
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Ok(Err(e)) => {
            // Most likely the worker was just killed by a concurrent request
            // timing out on it; report it under the same code.
            let served_by = director.worker_for_port(port, &worker);
            director.pool.release(Arc::clone(&served_by));
            warn!(pid = served_by.pid(), error = %e, "proxy error");
            Ok(worker_error_response(served_by.pid(), &e.to_string()))
        }
        Err(_) => {
            let served_by = director.worker_for_port(port, &worker);
            director.pool.release(Arc::clone(&served_by));
            warn!(pid = served_by.pid(), timeout = ?timeout, "restarting due to timeout");
            director.restarts.increment();
            served_by.cancel();
            Ok(worker_error_response(served_by.pid(), "restarted due to timeout"))
        }
    }
}

/// Point the request at the chosen worker, preserving method, path, query,
/// headers, and body. The hyper client adds no default `User-Agent`, so a
/// request without one stays without one.
fn rewrite_request<B>(req: Request<B>, port: u16) -> anyhow::Result<Request<B>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://localhost:{}{}", port, path_and_query).parse()?;

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }

    Ok(builder.body(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_director(default_timeout: Duration, header: &str) -> Director {
        Director::new(
            Arc::new(WorkerPool::new(4)),
            Arc::new(PortRegistry::new()),
            Arc::new(RestartCounter::new("test")),
            default_timeout,
            header,
        )
    }

    #[tokio::test]
    async fn effective_timeout_uses_default_without_header() {
        let director = test_director(Duration::from_secs(10), "X-Stabilize-Timeout");
        let headers = HeaderMap::new();
        assert_eq!(director.effective_timeout(&headers), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn effective_timeout_honors_override() {
        let director = test_director(Duration::from_secs(10), "X-Stabilize-Timeout");
        let mut headers = HeaderMap::new();
        headers.insert("x-stabilize-timeout", HeaderValue::from_static("100ms"));
        assert_eq!(
            director.effective_timeout(&headers),
            Duration::from_millis(100)
        );

        headers.insert("x-stabilize-timeout", HeaderValue::from_static("2s"));
        assert_eq!(director.effective_timeout(&headers), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn effective_timeout_falls_back_on_parse_failure() {
        let director = test_director(Duration::from_secs(5), "X-Stabilize-Timeout");
        let mut headers = HeaderMap::new();
        headers.insert("x-stabilize-timeout", HeaderValue::from_static("not-a-duration"));
        assert_eq!(director.effective_timeout(&headers), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn effective_timeout_ignored_when_disabled() {
        let director = test_director(Duration::from_secs(5), "");
        let mut headers = HeaderMap::new();
        headers.insert("x-stabilize-timeout", HeaderValue::from_static("100ms"));
        assert_eq!(director.effective_timeout(&headers), Duration::from_secs(5));
    }

    #[test]
    fn rewrite_points_at_worker_and_keeps_everything_else() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/items?a=1&b=2")
            .header("host", "front.example.com")
            .header("x-custom", "kept")
            .body(())
            .unwrap();

        let rewritten = rewrite_request(req, 7777).expect("rewrite");
        assert_eq!(
            rewritten.uri().to_string(),
            "http://localhost:7777/api/items?a=1&b=2"
        );
        assert_eq!(rewritten.method(), "POST");
        assert_eq!(rewritten.headers().get("host").unwrap(), "front.example.com");
        assert_eq!(rewritten.headers().get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn rewrite_defaults_to_root_path() {
        let req = Request::builder().uri("/").body(()).unwrap();
        let rewritten = rewrite_request(req, 8000).expect("rewrite");
        assert_eq!(rewritten.uri().to_string(), "http://localhost:8000/");
    }
}
