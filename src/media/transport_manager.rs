#![forbid(unsafe_code)]

// Transport management for WebRTC connections

use crate::media::config::WebRtcTransportConfig;
use crate::media::data_structures::{DtlsParameters, DtlsState, TransportRole};
use crate::media::engine::{HandlerId, Router, WebRtcTransport};
use crate::media::types::{
    EntityCounts, MediaError, MediaEvent, MediaResult, PeerMedia, PeerSnapshot, TransportEntry, TransportInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// Manages WebRTC transports for peers.
///
/// Uses per-peer locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups, never across await points), while each peer's
/// media state is protected by its own tokio::sync::Mutex (held across engine calls
/// so one peer's requests are applied in order, but only blocking that peer).
pub struct TransportManager {
    peers: Arc<StdRwLock<HashMap<String, Arc<TokioMutex<PeerMedia>>>>>,
    config: WebRtcTransportConfig,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl TransportManager {
    /// Creates a new TransportManager
    pub fn new(config: WebRtcTransportConfig, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            peers: Arc::new(StdRwLock::new(HashMap::new())),
            config,
            events,
        }
    }

    /// Registers a peer (brief outer lock, no await)
    pub fn add_peer(&self, peer_id: &str) -> Arc<TokioMutex<PeerMedia>> {
        {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(p) = peers.get(peer_id) {
                return Arc::clone(p);
            }
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(PeerMedia::new(peer_id.to_string()))))
            .clone()
    }

    /// Gets an existing peer's lock (brief outer read lock, no await)
    pub(crate) fn peer_lock(&self, peer_id: &str) -> MediaResult<Arc<TokioMutex<PeerMedia>>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(peer_id)
            .cloned()
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Creates the peer's transport for one direction. A peer holds at most one
    /// open transport per role.
    pub async fn create_transport(
        &self,
        peer_id: &str,
        router: &dyn Router,
        role: TransportRole,
    ) -> MediaResult<TransportInfo> {
        debug!("Creating {} transport for peer: {}", role, peer_id);

        let peer_lock = self.peer_lock(peer_id)?;
        let mut peer = peer_lock.lock().await;
        peer.prune_closed();

        if peer.transport(role).is_some() {
            return Err(MediaError::TransportExists(role));
        }

        let transport = router
            .create_webrtc_transport(self.config.to_transport_options())
            .await?;

        let transport_info = TransportInfo::from_transport(transport.as_ref());
        let handlers = self.setup_transport_handlers(&transport, peer_id, role);

        *peer.transport_slot(role) = Some(TransportEntry {
            transport,
            role,
            connected: false,
            _handlers: handlers,
        });

        info!("Created {} transport {} for peer {}", role, transport_info.id, peer_id);
        Ok(transport_info)
    }

    /// Completes the DTLS handshake of the peer's transport. Single use: a second
    /// call fails and leaves the transport as it was.
    pub async fn connect_transport(
        &self,
        peer_id: &str,
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        let peer_lock = self.peer_lock(peer_id)?;
        let mut peer = peer_lock.lock().await;

        let entry = peer
            .transport_slot(role)
            .as_mut()
            .ok_or(MediaError::TransportNotFound(role))?;

        if entry.transport.closed() {
            return Err(MediaError::TransportClosed(role));
        }
        if entry.connected {
            return Err(MediaError::AlreadyConnected(role));
        }
        dtls_parameters.validate().map_err(MediaError::InvalidRequest)?;

        entry.transport.connect(dtls_parameters).await?;
        entry.connected = true;

        info!("Connected {} transport {} for peer {}", role, entry.transport.id(), peer_id);
        Ok(())
    }

    /// Gets a peer's open entities
    pub async fn snapshot(&self, peer_id: &str) -> MediaResult<PeerSnapshot> {
        let peer_lock = self.peer_lock(peer_id)?;
        let peer = peer_lock.lock().await;
        Ok(peer.snapshot())
    }

    /// Sums open entities over every peer
    pub async fn entity_counts(&self) -> EntityCounts {
        let locks: Vec<Arc<TokioMutex<PeerMedia>>> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.values().cloned().collect()
        };

        let mut total = EntityCounts::default();
        for lock in locks {
            let counts = lock.lock().await.open_counts();
            total.transports += counts.transports;
            total.producers += counts.producers;
            total.consumers += counts.consumers;
        }
        total
    }

    /// Removes a peer and closes all their transports
    pub async fn remove_peer(&self, peer_id: &str) -> MediaResult<()> {
        let peer_lock = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.remove(peer_id)
        };

        match peer_lock {
            Some(lock) => {
                let mut peer = lock.lock().await;
                peer.close_all();
                info!("Removed peer {} and closed all media resources", peer_id);
                Ok(())
            }
            None => Err(MediaError::PeerNotFound(peer_id.to_string())),
        }
    }

    /// Sets up observers for a transport. They stay registered while the returned
    /// ids live in the peer's transport entry.
    fn setup_transport_handlers(
        &self,
        transport: &Arc<dyn WebRtcTransport>,
        peer_id: &str,
        role: TransportRole,
    ) -> Vec<HandlerId> {
        let transport_id = transport.id();
        let weak_transport = Arc::downgrade(transport);

        let on_dtls = transport.on_dtls_state_change(Arc::new({
            let peer_id = peer_id.to_string();
            move |dtls_state: DtlsState| {
                debug!("DTLS state: {:?} for {} transport {} (peer {})", dtls_state, role, transport_id, peer_id);
                if dtls_state == DtlsState::Closed {
                    if let Some(transport) = weak_transport.upgrade() {
                        info!("DTLS closed, tearing down {} transport {} (peer {})", role, transport_id, peer_id);
                        transport.close();
                    }
                }
            }
        }));

        let on_close = transport.on_close(Arc::new({
            let peer_id = peer_id.to_string();
            let events = self.events.clone();
            move || {
                warn!("Transport {} ({}) closed for peer {}", transport_id, role, peer_id);
                let _ = events.send(MediaEvent::TransportClosed {
                    peer_id: peer_id.clone(),
                    role,
                    transport_id,
                });
            }
        }));

        vec![on_dtls, on_close]
    }

    /// Closes all transports for all peers
    pub async fn close_all(&self) {
        info!("Closing all transports");

        let all_peers: Vec<(String, Arc<TokioMutex<PeerMedia>>)> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.drain().collect()
        };

        for (peer_id, lock) in all_peers {
            let mut peer = lock.lock().await;
            peer.close_all();
            debug!("Closed all transports for peer: {}", peer_id);
        }
    }
}
