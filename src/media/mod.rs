#![forbid(unsafe_code)]

// Media module - worker, router, transport, producer and consumer management
// Drives the media engine on behalf of signaling and reports closures back as MediaEvents

pub mod capabilities;
pub mod config;
pub mod consumer_manager;
pub mod data_structures;
pub mod engine;
pub mod producer_manager;
pub mod router_manager;
pub mod rtp_parameters;
pub mod transport_manager;
pub mod types;
pub mod worker_manager;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use consumer_manager::ConsumerManager;
pub use producer_manager::ProducerManager;
pub use router_manager::RouterManager;
pub use transport_manager::TransportManager;
pub use types::{ConsumerInfo, MediaError, MediaEvent, MediaResult, ProducerInfo, TransportInfo};
pub use worker_manager::WorkerManager;

use anyhow::Result;
use engine::MediaEngine;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::info;

/// Main MediaServer struct that coordinates all media operations
pub struct MediaServer {
    worker_manager: Arc<WorkerManager>,
    router_manager: Arc<RouterManager>,
    transport_manager: Arc<TransportManager>,
    producer_manager: Arc<ProducerManager>,
    consumer_manager: Arc<ConsumerManager>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
    config: Arc<MediaConfig>,
}

impl MediaServer {
    /// Starts the worker and wires the managers around it
    pub async fn new(engine: &dyn MediaEngine, config: MediaConfig) -> Result<Self> {
        info!(
            "Initializing MediaServer (RTC ports {}-{})",
            config.worker_config.rtc_min_port, config.worker_config.rtc_max_port
        );

        let config = Arc::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker_manager = Arc::new(WorkerManager::new(engine, &config.worker_config).await?);
        let router_manager = Arc::new(RouterManager::new(worker_manager.clone(), config.router_config.clone()));
        let transport_manager = Arc::new(TransportManager::new(
            config.webrtc_transport_config.clone(),
            events_tx.clone(),
        ));
        let producer_manager = Arc::new(ProducerManager::new(transport_manager.clone(), events_tx.clone()));
        let consumer_manager = Arc::new(ConsumerManager::new(transport_manager.clone(), events_tx));

        Ok(Self {
            worker_manager,
            router_manager,
            transport_manager,
            producer_manager,
            consumer_manager,
            events: StdMutex::new(Some(events_rx)),
            config,
        })
    }

    pub fn worker_manager(&self) -> Arc<WorkerManager> {
        self.worker_manager.clone()
    }

    pub fn router_manager(&self) -> Arc<RouterManager> {
        self.router_manager.clone()
    }

    pub fn transport_manager(&self) -> Arc<TransportManager> {
        self.transport_manager.clone()
    }

    pub fn producer_manager(&self) -> Arc<ProducerManager> {
        self.producer_manager.clone()
    }

    pub fn consumer_manager(&self) -> Arc<ConsumerManager> {
        self.consumer_manager.clone()
    }

    pub fn config(&self) -> Arc<MediaConfig> {
        self.config.clone()
    }

    /// Hands out the closure event stream. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MediaEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Closes transports, then routers, then the worker
    pub async fn shutdown(&self) {
        info!("Shutting down MediaServer");

        self.transport_manager.close_all().await;
        self.router_manager.close_all().await;
        self.worker_manager.shutdown();

        info!("MediaServer shutdown complete");
    }
}
