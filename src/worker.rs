use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle to one supervised worker subprocess.
///
/// A worker is spawned in its own process group so that anything it forks can
/// be torn down with it. The handle exposes two signals: `cancel`, which
/// kills the process tree, and `done`, which fires exactly once after the
/// process has been reaped (whether it was cancelled, crashed, or was killed
/// externally).
pub struct Worker {
    port: u16,
    pid: u32,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Worker {
    /// Spawn a worker process listening on `port`.
    ///
    /// stdout and stderr are piped and forwarded line-by-line to the log,
    /// tagged with the child pid. If the spawn itself fails the error is
    /// logged and a handle that is already dead (pid 0, `done` fired) is
    /// returned; the supervisor loop treats it like any other dead worker.
    pub fn spawn(command: &str, args: &[String], port: u16) -> Arc<Worker> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group so subprocesses the worker spawns die with it.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command, error = %e, "worker spawn failed");
                cancel_tx.send_replace(true);
                done_tx.send_replace(true);
                return Arc::new(Worker {
                    port,
                    pid: 0,
                    cancel_tx,
                    done_rx,
                });
            }
        };

        let pid = child.id().unwrap_or(0);

        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            tokio::spawn(forward_output(pid, stdout, stderr));
        }

        let worker = Arc::new(Worker {
            port,
            pid,
            cancel_tx,
            done_rx,
        });

        tokio::spawn(watch_worker(pid, child, cancel_rx, done_tx, worker.cancel_tx.clone()));

        worker
    }

    /// TCP port the worker is expected to listen on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pid of the child, or 0 if the spawn failed.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the worker is still usable. Monotonic: once false, always false.
    pub fn alive(&self) -> bool {
        !*self.cancel_tx.borrow()
    }

    /// Kill the worker and its whole process group. Idempotent; once `done`
    /// has fired this is a no-op.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Wait until the worker process has been reaped. Fires exactly once per
    /// worker lifetime; callers may wait concurrently.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Supervise the child until it exits, by whatever path.
///
/// Either the process dies on its own (crash, external kill) and we reap it,
/// or `cancel` fires and we run the termination protocol: SIGKILL the direct
/// child, best-effort SIGTERM to its process group, then reap. In both cases
/// the handle is marked dead and `done` fires last.
async fn watch_worker(
    pid: u32,
    mut child: Child,
    mut cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
) {
    let cancelled = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(pid, %status, "worker exited"),
                Err(e) => warn!(pid, error = %e, "waiting for worker"),
            }
            false
        }
        _ = cancel_rx.changed() => true,
    };

    if cancelled {
        if let Err(e) = child.start_kill() {
            warn!(pid, error = %e, "killing worker");
        }
        kill_process_group(pid);
        match child.wait().await {
            Ok(status) => info!(pid, %status, "worker killed"),
            Err(e) => warn!(pid, error = %e, "reaping worker"),
        }
    }

    cancel_tx.send_replace(true);
    done_tx.send_replace(true);
}

/// Forward the worker's merged output to the operational log.
async fn forward_output(pid: u32, stdout: ChildStdout, stderr: ChildStderr) {
    let out = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(pid, "{}", line);
        }
    };
    let err = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(pid, "{}", line);
        }
    };
    tokio::join!(out, err);
    debug!(pid, "worker output closed");
}

/// Send SIGTERM to the worker's process group so grand-children die too.
/// Not supported off Unix; there only the direct child is killed.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    unsafe {
        let pgid = libc::getpgid(pid as libc::pid_t);
        if pgid > 0 {
            libc::kill(-pgid, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
