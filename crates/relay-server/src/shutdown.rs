//! Shutdown: one cancellation token for every task, plus the named
//! background tasks (`http`, `broadcast`) that stopping waits on.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time `shutdown_and_wait` gives tasks before aborting them.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Which tasks stopped on their own and which had to be aborted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished before the deadline.
    pub stopped: Vec<&'static str>,
    /// Tasks aborted at the deadline.
    pub aborted: Vec<&'static str>,
}

/// Owns the shutdown token and the relay's background tasks.
///
/// Peer sessions are not tracked here; they watch the token and deregister
/// themselves.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tasks.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A clone of the token every task watches.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a background task to wait on at shutdown.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    /// Number of tasks currently tracked.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel the token, then give all tracked tasks until one shared
    /// deadline to finish. Tasks still running at the deadline are aborted.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> ShutdownReport {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = name, "task stopped");
                    report.stopped.push(name);
                }
                Ok(Err(e)) => {
                    warn!(task = name, error = %e, "task ended abnormally");
                    report.stopped.push(name);
                }
                Err(_) => {
                    warn!(task = name, ?timeout, "task did not stop in time, aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
