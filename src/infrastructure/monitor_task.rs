//! Background Monitor Tasks
//!
//! Spawns a periodic loop with a cooperative stop signal and joins it with a
//! bounded wait. A loop that does not exit in time is detached, never aborted.

use crate::domain::errors::MonitorError;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How long `stop` waits for a loop to finish its current iteration.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningTask {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Handle to one independently running monitor loop.
pub struct MonitorTask {
    name: &'static str,
    join_timeout: Duration,
    running: Mutex<Option<RunningTask>>,
}

impl MonitorTask {
    pub fn new(name: &'static str) -> Self {
        Self::with_join_timeout(name, DEFAULT_JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(name: &'static str, join_timeout: Duration) -> Self {
        Self {
            name,
            join_timeout,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a loop has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn `tick` every `interval` until stopped.
    ///
    /// The first tick runs after one full interval.
    pub fn start<F, Fut>(&self, interval: Duration, mut tick: F) -> Result<(), MonitorError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if let Some(task) = running.as_ref() {
            if !task.handle.is_finished() {
                return Err(MonitorError::AlreadyRunning(self.name));
            }
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| MonitorError::NoRuntime(self.name))?;

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let name = self.name;

        let handle = runtime.spawn(async move {
            tracing::info!("{} started (interval {:?})", name, interval);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => tick().await,
                }
            }
            tracing::info!("{} stopped", name);
        });

        *running = Some(RunningTask { stop_tx, handle });
        Ok(())
    }

    /// Signal the loop to stop and wait up to the join timeout.
    ///
    /// Returns false if the loop had to be abandoned. Stopping a loop that
    /// is not running is a no-op returning true.
    pub async fn stop(&self) -> bool {
        let task = self.running.lock().take();
        let Some(task) = task else {
            return true;
        };

        let _ = task.stop_tx.send(());

        match tokio::time::timeout(self.join_timeout, task.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("{} exited abnormally: {}", self.name, e);
                true
            }
            Err(_) => {
                tracing::warn!(
                    "{} did not stop within {:?}, abandoning it",
                    self.name,
                    self.join_timeout
                );
                false
            }
        }
    }
}
