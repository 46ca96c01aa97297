//! Demo backend used to exercise the stabilizer.
//!
//! Half the requests to `GET /` wedge the handling thread in a CPU loop,
//! simulating a worker whose OS thread is completely stuck; the other half
//! answer normally. Run it as the worker command to watch the stabilizer
//! kill and respawn the stuck instances.

use crate::cli::parse_listen_addr;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rand::Rng;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub async fn run(listen: &str) -> anyhow::Result<()> {
    let addr = parse_listen_addr(listen)?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "demo backend listening");

    let greeting: Arc<String> = Arc::new(format!("Hello from worker {}\n", listen));

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let greeting = Arc::clone(&greeting);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let greeting = Arc::clone(&greeting);
                        async move { handle_demo_request(req, greeting).await }
                    });
                    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "demo connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept demo connection");
            }
        }
    }
}

async fn handle_demo_request(
    _req: Request<hyper::body::Incoming>,
    greeting: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if rand::thread_rng().gen_bool(0.5) {
        info!("stuck!");
        // Pretend the server thread has gotten completely stuck in a loop.
        let mut i: u64 = 0;
        loop {
            i = i.wrapping_add(1);
            std::hint::black_box(i);
        }
    }

    Ok(Response::new(Full::new(Bytes::from(greeting.as_bytes().to_vec()))))
}
