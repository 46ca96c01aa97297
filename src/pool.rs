use crate::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// How long `acquire` backs off after dequeuing a dead handle, so it does not
/// spin while supervisors are still respawning.
const DEAD_HANDLE_PAUSE: Duration = Duration::from_millis(50);

/// Bounded FIFO of worker handles, capacity `workers * concurrency`.
///
/// Each entry is one admission slot: permission to run one request against
/// that worker. A worker published `C` times can serve at most `C` requests
/// concurrently, with no extra bookkeeping beyond the queue itself. Handles
/// for dead workers may linger in the queue; `acquire` filters them out.
pub struct WorkerPool {
    slots: mpsc::Sender<Arc<Worker>>,
    queue: Mutex<mpsc::Receiver<Arc<Worker>>>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let (slots, queue) = mpsc::channel(capacity);
        Self {
            slots,
            queue: Mutex::new(queue),
        }
    }

    /// Enqueue a handle, waiting for capacity. Supervisors publish through
    /// this while simultaneously watching their worker's `done` signal.
    pub async fn publish(&self, worker: Arc<Worker>) {
        // The receiver lives as long as the pool, so this only fails after
        // the pool itself is gone.
        let _ = self.slots.send(worker).await;
    }

    /// Dequeue the next live handle.
    ///
    /// Blocks until one is available. Dead handles are discarded with a short
    /// pause; the returned worker was alive at the instant of return, though
    /// it may die immediately after.
    pub async fn acquire(&self) -> Arc<Worker> {
        loop {
            let worker = { self.queue.lock().await.recv().await };
            match worker {
                Some(w) if w.alive() => return w,
                Some(w) => {
                    debug!(pid = w.pid(), port = w.port(), "discarding dead worker handle");
                    tokio::time::sleep(DEAD_HANDLE_PAUSE).await;
                }
                None => tokio::time::sleep(DEAD_HANDLE_PAUSE).await,
            }
        }
    }

    /// Return a handle to the queue without blocking the caller. Called from
    /// response and error paths, which must never stall on pool capacity.
    pub fn release(&self, worker: Arc<Worker>) {
        let slots = self.slots.clone();
        tokio::spawn(async move {
            let _ = slots.send(worker).await;
        });
    }

    /// Number of handles currently queued.
    pub fn depth(&self) -> usize {
        self.slots.max_capacity() - self.slots.capacity()
    }
}
