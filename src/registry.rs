use crate::worker::Worker;
use dashmap::DashMap;
use std::sync::Arc;

/// Mapping from worker port to worker handle.
///
/// Supervisors record each worker here on spawn; the request router reads it
/// back in response and error paths to find the worker that served a request
/// (the outbound request's port is the only key that survives the proxy
/// machinery). Entries are never pruned on death; the next worker to start
/// on a port simply overwrites the old handle.
#[derive(Default)]
pub struct PortRegistry {
    workers: DashMap<u16, Arc<Worker>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, port: u16, worker: Arc<Worker>) {
        self.workers.insert(port, worker);
    }

    pub fn get(&self, port: u16) -> Option<Arc<Worker>> {
        self.workers.get(&port).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_lookup() {
        let registry = PortRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(4000).is_none());

        let worker = Worker::spawn("sleep", &["300".to_string()], 4000);
        registry.insert(4000, Arc::clone(&worker));

        let found = registry.get(4000).expect("worker should be registered");
        assert_eq!(found.pid(), worker.pid());
        assert_eq!(registry.len(), 1);

        worker.cancel();
    }

    #[tokio::test]
    async fn reused_port_overwrites_entry() {
        let registry = PortRegistry::new();

        let first = Worker::spawn("sleep", &["300".to_string()], 4001);
        registry.insert(4001, Arc::clone(&first));
        first.cancel();
        first.done().await;

        // A dead worker's entry stays until the port is reused.
        assert!(!registry.get(4001).expect("entry remains").alive());

        let second = Worker::spawn("sleep", &["300".to_string()], 4001);
        registry.insert(4001, Arc::clone(&second));
        assert_eq!(registry.get(4001).expect("replaced").pid(), second.pid());
        assert_eq!(registry.len(), 1);

        second.cancel();
    }
}
