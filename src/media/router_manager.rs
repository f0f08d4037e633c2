#![forbid(unsafe_code)]

// Router management for sessions

use crate::media::config::RouterConfig;
use crate::media::engine::{HandlerId, Router};
use crate::media::types::{MediaError, MediaResult};
use crate::media::worker_manager::WorkerManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A router and the observer watching it
struct RouterInfo {
    router: Arc<dyn Router>,
    _close_handler: HandlerId,
}

/// Manages one router per session
pub struct RouterManager {
    routers: Arc<RwLock<HashMap<String, RouterInfo>>>,
    worker_manager: Arc<WorkerManager>,
    config: RouterConfig,
}

impl RouterManager {
    /// Creates a new RouterManager
    pub fn new(worker_manager: Arc<WorkerManager>, config: RouterConfig) -> Self {
        Self {
            routers: Arc::new(RwLock::new(HashMap::new())),
            worker_manager,
            config,
        }
    }

    /// Gets the session's router, creating it on first use.
    /// Returns the router and whether it was created by this call.
    pub async fn get_or_create_router(&self, session_id: &str) -> MediaResult<(Arc<dyn Router>, bool)> {
        // Fast path: router exists and is open
        {
            let routers = self.routers.read().await;
            if let Some(info) = routers.get(session_id) {
                if !info.router.closed() {
                    return Ok((Arc::clone(&info.router), false));
                }
            }
        }

        // Slow path: create under the write lock so concurrent joins share one router
        let mut routers = self.routers.write().await;
        if let Some(info) = routers.get(session_id) {
            if !info.router.closed() {
                return Ok((Arc::clone(&info.router), false));
            }
        }

        let worker = self.worker_manager.worker()?;
        let router = worker.create_router(self.config.to_router_options()).await?;
        info!("Created router {} for session {} on worker {}", router.id(), session_id, worker.id());

        let close_handler = router.on_close(Arc::new({
            let session_id = session_id.to_string();
            let router_id = router.id();
            move || {
                warn!("Router {} closed for session: {}", router_id, session_id);
            }
        }));

        routers.insert(
            session_id.to_string(),
            RouterInfo {
                router: Arc::clone(&router),
                _close_handler: close_handler,
            },
        );

        Ok((router, true))
    }

    /// Gets a router for a session
    pub async fn get_router(&self, session_id: &str) -> MediaResult<Arc<dyn Router>> {
        let routers = self.routers.read().await;
        routers
            .get(session_id)
            .filter(|info| !info.router.closed())
            .map(|info| Arc::clone(&info.router))
            .ok_or_else(|| MediaError::SessionNotFound(session_id.to_string()))
    }

    /// Removes and closes the router of a session
    pub async fn remove_router(&self, session_id: &str) -> MediaResult<()> {
        let removed = self.routers.write().await.remove(session_id);
        match removed {
            Some(info) => {
                info.router.close();
                info!("Removed router {} for session {}", info.router.id(), session_id);
                Ok(())
            }
            None => Err(MediaError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Checks if a router exists for a session
    pub async fn has_router(&self, session_id: &str) -> bool {
        self.routers.read().await.contains_key(session_id)
    }

    /// Gets the number of active routers
    pub async fn router_count(&self) -> usize {
        self.routers.read().await.len()
    }

    /// Closes all routers
    pub async fn close_all(&self) {
        info!("Closing all routers");

        let routers: Vec<(String, RouterInfo)> = self.routers.write().await.drain().collect();
        for (session_id, info) in routers {
            info.router.close();
            debug!("Closed router for session: {}", session_id);
        }
    }
}
