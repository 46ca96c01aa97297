use crate::pool::WorkerPool;
use crate::registry::PortRegistry;
use crate::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Literal replaced with the chosen port in worker argv elements.
const PORT_TOKEN: &str = "{{.Port}}";

/// Delay before retrying when no free port could be obtained.
const FREE_PORT_RETRY: Duration = Duration::from_secs(1);

/// Keeps `N` worker slots continuously populated by live workers.
///
/// Each slot runs an independent loop: pick a free port, spawn a worker,
/// register it, feed `concurrency` admission slots into the pool, then wait
/// for the worker to die and start over. Dead workers are always replaced;
/// nothing outside these loops ever spawns a worker.
pub struct Stabilizer {
    command: String,
    args: Vec<String>,
    concurrency: usize,
    pool: Arc<WorkerPool>,
    registry: Arc<PortRegistry>,
}

impl Stabilizer {
    pub fn new(
        command: String,
        args: Vec<String>,
        concurrency: usize,
        pool: Arc<WorkerPool>,
        registry: Arc<PortRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            command,
            args,
            concurrency,
            pool,
            registry,
        })
    }

    /// Spawn the per-slot supervisor loops. Returns immediately; the loops
    /// run for the life of the process.
    pub fn ensure_workers(self: &Arc<Self>, n: usize) {
        info!(
            command = %self.command,
            args = ?self.args,
            workers = n,
            concurrency = self.concurrency,
            "worker command"
        );
        for slot in 0..n {
            let stabilizer = Arc::clone(self);
            tokio::spawn(async move {
                stabilizer.run_slot(slot).await;
            });
        }
    }

    async fn run_slot(&self, slot: usize) {
        loop {
            let port = match free_port().await {
                Ok(port) => port,
                Err(e) => {
                    error!(slot, error = %e, "failed to find free port");
                    tokio::time::sleep(FREE_PORT_RETRY).await;
                    continue;
                }
            };

            let args = template_args(&self.args, port);
            let worker = Worker::spawn(&self.command, &args, port);
            self.registry.insert(port, Arc::clone(&worker));
            info!(slot, pid = worker.pid(), port, "worker started");

            // Feed the pool one admission slot at a time, but stop early if
            // the worker dies while we are blocked on pool capacity.
            let mut published = 0;
            while published < self.concurrency {
                tokio::select! {
                    _ = self.pool.publish(Arc::clone(&worker)) => published += 1,
                    _ = worker.done() => break,
                }
            }

            worker.done().await;
            info!(slot, pid = worker.pid(), port, "worker died, respawning");
        }
    }
}

/// Substitute the port token into the argv template.
pub fn template_args(args: &[String], port: u16) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|arg| arg.replace(PORT_TOKEN, &port))
        .collect()
}

/// Ask the OS for a currently-unused local TCP port.
///
/// The listener is dropped before the worker binds, so the port can in
/// principle be stolen in between; live-port uniqueness holds because every
/// simultaneously-alive worker got a distinct port from here.
pub async fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_replaces_port_token() {
        let args = vec![
            "-c".to_string(),
            "exec server --port {{.Port}}".to_string(),
            "{{.Port}}:{{.Port}}".to_string(),
            "plain".to_string(),
        ];
        let substituted = template_args(&args, 9123);
        assert_eq!(
            substituted,
            vec![
                "-c".to_string(),
                "exec server --port 9123".to_string(),
                "9123:9123".to_string(),
                "plain".to_string(),
            ]
        );
    }

    #[test]
    fn template_leaves_empty_args_alone() {
        assert!(template_args(&[], 8000).is_empty());
    }

    #[tokio::test]
    async fn free_port_returns_bindable_port() {
        let port = free_port().await.expect("free port");
        assert!(port > 0);
        // The port is released again and can be bound.
        TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("port should be free after the probe listener drops");
    }

    #[tokio::test]
    async fn distinct_ports_for_concurrent_probes() {
        // Hold both listeners so the second probe cannot see the first port.
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(a.local_addr().unwrap().port(), b.local_addr().unwrap().port());
    }
}
