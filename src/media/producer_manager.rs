#![forbid(unsafe_code)]

// Producer creation on send transports

use crate::media::capabilities;
use crate::media::data_structures::{ProducerId, TransportRole};
use crate::media::engine::{HandlerId, Producer, ProducerOptions, Router};
use crate::media::rtp_parameters::{MediaKind, RtpParameters};
use crate::media::transport_manager::TransportManager;
use crate::media::types::{MediaError, MediaEvent, MediaResult, ProducerEntry, ProducerInfo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Binds incoming media tracks to peers' send transports
pub struct ProducerManager {
    transports: Arc<TransportManager>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl ProducerManager {
    pub fn new(transports: Arc<TransportManager>, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self { transports, events }
    }

    /// Creates a producer on the peer's connected send transport
    ///
    /// # Errors
    /// Fails if the send transport is missing, closed or not yet connected, or if the
    /// RTP parameters do not fit the router's capabilities
    pub async fn produce(
        &self,
        peer_id: &str,
        router: &dyn Router,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: serde_json::Value,
    ) -> MediaResult<ProducerInfo> {
        let peer_lock = self.transports.peer_lock(peer_id)?;
        let mut peer = peer_lock.lock().await;

        let entry = peer
            .transport(TransportRole::Send)
            .ok_or(MediaError::TransportNotFound(TransportRole::Send))?;
        if entry.transport.closed() {
            return Err(MediaError::TransportClosed(TransportRole::Send));
        }
        if !entry.connected {
            return Err(MediaError::NotConnected(TransportRole::Send));
        }

        capabilities::validate_producer_parameters(kind, &rtp_parameters, router.rtp_capabilities())
            .map_err(MediaError::InvalidRequest)?;

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.app_data = app_data;
        let producer = entry.transport.produce(options).await?;

        let producer_id = producer.id();
        let handlers = self.setup_producer_handlers(&producer, peer_id);
        peer.producers.retain(|_, entry| !entry.producer.closed());
        peer.producers.insert(producer_id, ProducerEntry { producer, _handlers: handlers });

        info!("Created {} producer {} for peer {}", kind, producer_id, peer_id);
        Ok(ProducerInfo { id: producer_id, kind })
    }

    /// Closes one of the peer's producers; its consumers close with it
    pub async fn close_producer(&self, peer_id: &str, producer_id: ProducerId) -> MediaResult<()> {
        let peer_lock = self.transports.peer_lock(peer_id)?;
        let mut peer = peer_lock.lock().await;

        let entry = peer
            .producers
            .remove(&producer_id)
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;
        if entry.producer.closed() {
            return Err(MediaError::ProducerClosed(producer_id.to_string()));
        }
        entry.producer.close();

        info!("Closed producer {} for peer {}", producer_id, peer_id);
        Ok(())
    }

    /// Producer ids of a peer that are still open
    pub async fn producer_ids(&self, peer_id: &str) -> MediaResult<Vec<ProducerId>> {
        let peer_lock = self.transports.peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;
        Ok(peer
            .producers
            .values()
            .filter(|entry| !entry.producer.closed())
            .map(|entry| entry.producer.id())
            .collect())
    }

    fn setup_producer_handlers(&self, producer: &Arc<dyn Producer>, peer_id: &str) -> Vec<HandlerId> {
        let producer_id = producer.id();

        let on_transport_close = producer.on_transport_close(Arc::new({
            let peer_id = peer_id.to_string();
            move || {
                debug!("Send transport closed under producer {} of peer {}", producer_id, peer_id);
            }
        }));

        let on_close = producer.on_close(Arc::new({
            let peer_id = peer_id.to_string();
            let events = self.events.clone();
            move || {
                info!("Producer {} closed for peer {}", producer_id, peer_id);
                let _ = events.send(MediaEvent::ProducerClosed {
                    peer_id: peer_id.clone(),
                    producer_id,
                });
            }
        }));

        vec![on_transport_close, on_close]
    }
}
