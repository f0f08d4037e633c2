#![forbid(unsafe_code)]

// Consumer creation on receive transports and the paused -> active lifecycle

use crate::media::data_structures::{ConsumerId, ProducerId, TransportRole};
use crate::media::engine::{Consumer, ConsumerOptions, HandlerId, Router};
use crate::media::rtp_parameters::RtpCapabilities;
use crate::media::transport_manager::TransportManager;
use crate::media::types::{
    CloseReason, ConsumerEntry, ConsumerInfo, MediaError, MediaEvent, MediaResult,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Binds peers' receive transports to existing producers
pub struct ConsumerManager {
    transports: Arc<TransportManager>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl ConsumerManager {
    pub fn new(transports: Arc<TransportManager>, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self { transports, events }
    }

    /// Whether the router can forward the producer to a peer with these capabilities
    pub fn can_consume(&self, router: &dyn Router, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        router.can_consume(producer_id, capabilities)
    }

    /// Creates a paused consumer of `producer_id` on the peer's receive transport.
    /// Compatibility is checked before anything is created.
    pub async fn consume(
        &self,
        peer_id: &str,
        router: &dyn Router,
        producer_id: ProducerId,
        capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerInfo> {
        let peer_lock = self.transports.peer_lock(peer_id)?;
        let mut peer = peer_lock.lock().await;

        let entry = peer
            .transport(TransportRole::Receive)
            .ok_or(MediaError::TransportNotFound(TransportRole::Receive))?;
        if entry.transport.closed() {
            return Err(MediaError::TransportClosed(TransportRole::Receive));
        }
        if !entry.connected {
            return Err(MediaError::NotConnected(TransportRole::Receive));
        }

        if !self.can_consume(router, &producer_id, &capabilities) {
            return Err(MediaError::CannotConsume(producer_id.to_string()));
        }

        let mut options = ConsumerOptions::new(producer_id, capabilities);
        options.paused = true;
        let consumer = entry.transport.consume(options).await?;

        let consumer_info = ConsumerInfo::from_consumer(consumer.as_ref());
        let handlers = self.setup_consumer_handlers(&consumer, peer_id);
        peer.consumers.retain(|_, entry| !entry.consumer.closed());
        peer.consumers.insert(consumer_info.id, ConsumerEntry { consumer, _handlers: handlers });

        info!("Created consumer {} for producer {} and peer {}", consumer_info.id, producer_id, peer_id);
        Ok(consumer_info)
    }

    /// Starts forwarding on a paused consumer
    ///
    /// # Errors
    /// Fails if the consumer is unknown, already closed (including when its producer or
    /// transport went away in the meantime), or not paused
    pub async fn resume(&self, peer_id: &str, consumer_id: ConsumerId) -> MediaResult<()> {
        let peer_lock = self.transports.peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;

        let consumer = &peer
            .consumers
            .get(&consumer_id)
            .ok_or_else(|| MediaError::ConsumerNotFound(consumer_id.to_string()))?
            .consumer;

        if consumer.closed() {
            return Err(MediaError::ConsumerClosed(consumer_id.to_string()));
        }
        if !consumer.paused() {
            return Err(MediaError::ConsumerNotPaused(consumer_id.to_string()));
        }

        consumer.resume().await?;

        info!("Resumed consumer {} for peer {}", consumer_id, peer_id);
        Ok(())
    }

    fn setup_consumer_handlers(&self, consumer: &Arc<dyn Consumer>, peer_id: &str) -> Vec<HandlerId> {
        let consumer_id = consumer.id();
        let producer_id = consumer.producer_id();

        let closed_by = |reason: CloseReason| {
            let peer_id = peer_id.to_string();
            let events = self.events.clone();
            Arc::new(move || {
                info!("Consumer {} of peer {} closed: {:?}", consumer_id, peer_id, reason);
                let _ = events.send(MediaEvent::ConsumerClosed {
                    peer_id: peer_id.clone(),
                    consumer_id,
                    producer_id,
                    reason,
                });
            })
        };

        let on_producer_close = consumer.on_producer_close(closed_by(CloseReason::ProducerClosed));
        let on_transport_close = consumer.on_transport_close(closed_by(CloseReason::TransportClosed));
        let on_close = consumer.on_close(Arc::new({
            let peer_id = peer_id.to_string();
            move || {
                debug!("Consumer {} closed for peer {}", consumer_id, peer_id);
            }
        }));

        vec![on_producer_close, on_transport_close, on_close]
    }
}
