use clap::{CommandFactory, Parser};
use stabilizer::cli::{parse_listen_addr, Options};
use stabilizer::metrics::{MetricsServer, RestartCounter};
use stabilizer::pool::WorkerPool;
use stabilizer::proxy::{Director, ProxyServer};
use stabilizer::registry::PortRegistry;
use stabilizer::supervisor::Stabilizer;
use std::sync::Arc;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stabilizer=info".parse().expect("valid log directive")),
        )
        .init();

    let opts = Options::parse();

    if opts.demo {
        return stabilizer::demo::run(&opts.demo_listen).await;
    }

    // The worker invocation needs a command plus at least one argument.
    if opts.command.len() < 2 {
        let _ = Options::command().print_help();
        std::process::exit(2);
    }

    let restarts = Arc::new(RestartCounter::new(&opts.prometheus_app_name));

    if !opts.prometheus.is_empty() {
        let metrics_addr = parse_listen_addr(&opts.prometheus)?;
        let metrics_server = MetricsServer::new(metrics_addr, Arc::clone(&restarts));
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    let pool = Arc::new(WorkerPool::new(opts.workers * opts.concurrency));
    let registry = Arc::new(PortRegistry::new());

    let supervisor = Stabilizer::new(
        opts.command[0].clone(),
        opts.command[1..].to_vec(),
        opts.concurrency,
        Arc::clone(&pool),
        Arc::clone(&registry),
    );
    supervisor.ensure_workers(opts.workers);

    let director = Arc::new(Director::new(
        pool,
        registry,
        restarts,
        opts.timeout,
        &opts.header,
    ));

    let listen_addr = parse_listen_addr(&opts.listen)?;
    ProxyServer::new(listen_addr, director).run().await
}
