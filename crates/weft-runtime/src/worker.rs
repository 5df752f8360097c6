//! Worker pool
//!
//! Runs N concurrent drivers that poll the dispatcher. Shutdown is
//! signal-driven: each driver finishes its current task and exits; a hard
//! deadline bounds the wait, after which stragglers are aborted.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use weft_store::EventStore;

use crate::dispatcher::Dispatcher;
use crate::registry::Registry;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent drivers
    pub workers: usize,

    /// Sleep between polls when no task is available
    pub poll_interval: Duration,

    /// Hard deadline for graceful shutdown
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Pool of task-driving workers
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    drivers: Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<Registry>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            dispatcher: Arc::new(Dispatcher::new(store, registry)),
            config,
            shutdown_tx,
            shutdown_rx,
            drivers: Mutex::new(None),
        }
    }

    /// Spawn the driver loops.
    #[instrument(skip(self))]
    pub fn start(&self) {
        let mut drivers = JoinSet::new();

        info!(
            workers = self.config.workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "starting worker pool"
        );

        for worker_id in 0..self.config.workers {
            let dispatcher = Arc::clone(&self.dispatcher);
            let poll_interval = self.config.poll_interval;
            let mut shutdown_rx = self.shutdown_rx.clone();

            drivers.spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        debug!(worker_id, "driver shutting down");
                        break;
                    }

                    match dispatcher.run_once().await {
                        // Claimed and processed a task; poll again at once.
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = shutdown_rx.changed() => {}
                            }
                        }
                        Err(err) => {
                            error!(worker_id, "driver error: {err}");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                _ = shutdown_rx.changed() => {}
                            }
                        }
                    }
                }
            });
        }

        *self.drivers.lock() = Some(drivers);
    }

    /// Signal shutdown and wait for drivers to finish their current task.
    ///
    /// Drivers still running at the hard deadline are aborted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let Some(mut drivers) = self.drivers.lock().take() else {
            return;
        };

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while drivers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "shutdown deadline reached, aborting remaining drivers"
            );
            drivers.abort_all();
            while drivers.join_next().await.is_some() {}
        }

        info!("worker pool stopped");
    }

    /// Run until the shutdown flag is raised externally (tests and
    /// embedders that manage their own signals).
    pub async fn run_until_shutdown(&self) {
        self.start();
        let mut shutdown_rx = self.shutdown_rx.clone();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// A handle that can raise the shutdown flag from another task.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new()
            .with_workers(8)
            .with_poll_interval(Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_worker_count_floor() {
        let config = WorkerPoolConfig::new().with_workers(0);
        assert_eq!(config.workers, 1);
    }
}
