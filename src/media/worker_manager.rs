#![forbid(unsafe_code)]

// Media worker lifecycle and liveness

use crate::media::config::WorkerConfig;
use crate::media::engine::{HandlerId, MediaEngine, Worker};
use crate::media::types::{MediaError, MediaResult};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Owns the single media worker of the process.
///
/// The worker cannot be replaced at runtime: when it dies, every router, transport,
/// producer and consumer died with it and only a process restart (with clients
/// renegotiating) recovers. The death is published on a watch channel for `main`.
pub struct WorkerManager {
    worker: Arc<dyn Worker>,
    death: watch::Receiver<Option<String>>,
    _dead_handler: HandlerId,
}

impl WorkerManager {
    /// Starts the worker bound to the configured RTC port range
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if the engine refuses to start it
    pub async fn new(engine: &dyn MediaEngine, config: &WorkerConfig) -> MediaResult<Self> {
        let worker = engine
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;

        info!(
            "Created worker {} (pid {}) on RTC ports {}-{}",
            worker.id(),
            worker.pid(),
            config.rtc_min_port,
            config.rtc_max_port
        );

        let (death_tx, death) = watch::channel(None);
        let worker_id = worker.id();
        let pid = worker.pid();
        let dead_handler = worker.on_dead(Arc::new(move |reason: &str| {
            error!("Worker {} (pid {}) died: {}", worker_id, pid, reason);
            let _ = death_tx.send(Some(reason.to_string()));
        }));

        Ok(Self {
            worker,
            death,
            _dead_handler: dead_handler,
        })
    }

    /// Gets the worker, failing once it is gone
    pub fn worker(&self) -> MediaResult<Arc<dyn Worker>> {
        if self.worker.closed() {
            return Err(MediaError::WorkerError(format!("Worker {} is closed", self.worker.id())));
        }
        Ok(Arc::clone(&self.worker))
    }

    /// Checks if the worker is still alive
    pub fn is_alive(&self) -> bool {
        !self.worker.closed() && self.death.borrow().is_none()
    }

    /// Resolves with the death reason if the worker dies unexpectedly.
    /// Returns `None` if the worker was shut down on purpose.
    pub async fn wait_for_death(&self) -> Option<String> {
        let mut death = self.death.clone();
        let reason = match death.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason
    }

    /// Closes the worker; no death is reported
    pub fn shutdown(&self) {
        info!("Shutting down worker {}", self.worker.id());
        self.worker.close();
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        debug!("WorkerManager being dropped");
    }
}
