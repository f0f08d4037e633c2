#![forbid(unsafe_code)]

// Session module - peer admission, per-session media state and notifications

use crate::media::capabilities;
use crate::media::data_structures::{ConsumerId, DtlsParameters, ProducerId, TransportRole};
use crate::media::engine::Router;
use crate::media::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::media::types::{ConsumerInfo, MediaError, MediaEvent, MediaResult, ProducerInfo, TransportInfo};
use crate::media::MediaServer;
use crate::metrics::{MediaGauges, ServerMetrics};
use crate::signaling::protocol::{self, ServerMessage};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts to join a session that is being torn down concurrently
const ADMIT_ATTEMPTS: usize = 3;

/// A peer admitted to a session
#[derive(Clone)]
pub struct Peer {
    pub id: String,
    pub sender: mpsc::Sender<Arc<String>>,
}

/// Session state: one router shared by the peers that joined it
pub struct Session {
    pub id: String,
    router: Arc<dyn Router>,
    pub peers: HashMap<String, Peer>,
    /// Open producers of the session: producer -> (owning peer, kind)
    producers: HashMap<ProducerId, (String, MediaKind)>,
    /// Set by the last peer leaving; admissions holding a stale handle must retry
    closing: bool,
}

impl Session {
    fn new(id: String, router: Arc<dyn Router>) -> Self {
        Self {
            id,
            router,
            peers: HashMap::new(),
            producers: HashMap::new(),
            closing: false,
        }
    }

    /// Broadcast a message to all peers except the sender
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let json = match protocol::encode(None, message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, peer) in &self.peers {
            if id != sender_id {
                match peer.sender.try_send(json.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Channel full for peer {} in session {}, dropping message", id, self.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Channel closed for peer {} in session {} (disconnected)", id, self.id);
                    }
                }
            }
        }
    }

    /// Send a message to a specific peer
    fn send_to(&self, peer_id: &str, message: &ServerMessage) {
        let json = match protocol::encode(None, message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                return;
            }
        };
        if let Some(peer) = self.peers.get(peer_id) {
            match peer.sender.try_send(json) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for peer {} in session {}, dropping message", peer_id, self.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for peer {} in session {} (disconnected)", peer_id, self.id);
                }
            }
        }
    }
}

type SessionMap = StdRwLock<HashMap<String, Arc<TokioRwLock<Session>>>>;

struct Inner {
    sessions: SessionMap,
    /// peer -> session it was admitted to
    peer_sessions: StdRwLock<HashMap<String, String>>,
}

impl Inner {
    fn session_of(&self, peer_id: &str) -> MediaResult<Arc<TokioRwLock<Session>>> {
        let session_id = {
            let peer_sessions = self.peer_sessions.read().unwrap_or_else(|e| e.into_inner());
            peer_sessions
                .get(peer_id)
                .cloned()
                .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))?
        };
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(&session_id)
            .cloned()
            .ok_or(MediaError::SessionNotFound(session_id))
    }
}

/// Authoritative mapping from peers to sessions, routers and media entities.
///
/// Uses per-session locking: the outer maps are protected by std::sync::RwLock
/// (held only for brief lookups/inserts, never across await points), while each
/// session is protected by its own tokio::sync::RwLock. Producer and consumer
/// creation take the session write lock, so entity mutations are serialized per
/// session while different sessions proceed in parallel.
pub struct SessionRegistry {
    inner: Arc<Inner>,
    media_server: Arc<MediaServer>,
    metrics: ServerMetrics,
}

impl SessionRegistry {
    /// Creates the registry and starts relaying closure events to peers
    pub fn new(media_server: Arc<MediaServer>, metrics: ServerMetrics) -> Self {
        let inner = Arc::new(Inner {
            sessions: StdRwLock::new(HashMap::new()),
            peer_sessions: StdRwLock::new(HashMap::new()),
        });

        match media_server.take_events() {
            Some(events) => {
                tokio::spawn(Self::event_relay_task(events, Arc::downgrade(&inner)));
            }
            None => warn!("Media events already taken, closure notifications disabled"),
        }

        Self {
            inner,
            media_server,
            metrics,
        }
    }

    pub fn media_server(&self) -> &MediaServer {
        &self.media_server
    }

    /// Background task turning engine closure events into peer notifications.
    /// Uses a Weak reference so the task exits when the registry is dropped.
    async fn event_relay_task(mut rx: mpsc::UnboundedReceiver<MediaEvent>, weak_inner: Weak<Inner>) {
        while let Some(event) = rx.recv().await {
            let inner = match weak_inner.upgrade() {
                Some(inner) => inner,
                None => break,
            };

            match event {
                MediaEvent::ProducerClosed { peer_id, producer_id } => {
                    // Producers closed by request or disconnect are announced there already
                    if let Ok(session_lock) = inner.session_of(&peer_id) {
                        let mut session = session_lock.write().await;
                        if session.producers.remove(&producer_id).is_some() {
                            session.broadcast_except(
                                &peer_id,
                                &ServerMessage::ProducerClosed { peer_id: peer_id.clone(), producer_id },
                            );
                        }
                    }
                }
                MediaEvent::ConsumerClosed {
                    peer_id,
                    consumer_id,
                    producer_id,
                    reason,
                } => {
                    if let Ok(session_lock) = inner.session_of(&peer_id) {
                        session_lock.read().await.send_to(
                            &peer_id,
                            &ServerMessage::ConsumerClosed {
                                consumer_id,
                                producer_id,
                                reason,
                            },
                        );
                    }
                }
                MediaEvent::TransportClosed {
                    peer_id,
                    role,
                    transport_id,
                } => {
                    if let Ok(session_lock) = inner.session_of(&peer_id) {
                        session_lock
                            .read()
                            .await
                            .send_to(&peer_id, &ServerMessage::TransportClosed { role, transport_id });
                    }
                }
            }
        }
        debug!("Media event relay finished");
    }

    /// Gets or creates a session, creating its router if needed
    async fn get_or_create_session(&self, session_id: &str) -> MediaResult<Arc<TokioRwLock<Session>>> {
        // Fast path: session exists (brief outer read lock)
        {
            let sessions = self.inner.sessions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(session) = sessions.get(session_id) {
                return Ok(session.clone());
            }
        }

        let (router, created) = self
            .media_server
            .router_manager()
            .get_or_create_router(session_id)
            .await?;
        if created {
            self.metrics.inc_sessions_created();
            info!("Created session {} with router {}", session_id, router.id());
        }

        let mut sessions = self.inner.sessions.write().unwrap_or_else(|e| e.into_inner());
        Ok(sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(TokioRwLock::new(Session::new(session_id.to_string(), router))))
            .clone())
    }

    /// Admits a peer to a session. Without a session id a fresh, isolated session
    /// is created. Returns the session id.
    ///
    /// # Errors
    /// Returns an error if the router for a new session cannot be created
    pub async fn admit(
        &self,
        session_id: Option<String>,
        peer_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> MediaResult<String> {
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        for _ in 0..ADMIT_ATTEMPTS {
            let session_lock = self.get_or_create_session(&session_id).await?;
            let mut session = session_lock.write().await;

            if session.closing || session.router.closed() {
                // Emptied and torn down between lookup and lock; drop the stale entry
                drop(session);
                let mut sessions = self.inner.sessions.write().unwrap_or_else(|e| e.into_inner());
                if sessions.get(&session_id).is_some_and(|s| Arc::ptr_eq(s, &session_lock)) {
                    sessions.remove(&session_id);
                }
                continue;
            }

            session.peers.insert(
                peer_id.to_string(),
                Peer {
                    id: peer_id.to_string(),
                    sender,
                },
            );
            self.media_server.transport_manager().add_peer(peer_id);
            self.inner
                .peer_sessions
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(peer_id.to_string(), session_id.clone());

            info!("Peer {} joined session {} ({} peers)", peer_id, session_id, session.peers.len());
            return Ok(session_id);
        }

        Err(MediaError::SessionNotFound(session_id))
    }

    async fn router_of(&self, peer_id: &str) -> MediaResult<Arc<dyn Router>> {
        let session_lock = self.inner.session_of(peer_id)?;
        let session = session_lock.read().await;
        Ok(session.router.clone())
    }

    /// Capabilities of the router of the peer's session
    pub async fn get_capabilities(&self, peer_id: &str) -> MediaResult<RtpCapabilities> {
        let router = self.router_of(peer_id).await?;
        Ok(capabilities::get_capabilities(router.as_ref()))
    }

    pub async fn create_transport(&self, peer_id: &str, role: TransportRole) -> MediaResult<TransportInfo> {
        let router = self.router_of(peer_id).await?;
        self.media_server
            .transport_manager()
            .create_transport(peer_id, router.as_ref(), role)
            .await
    }

    pub async fn connect_transport(
        &self,
        peer_id: &str,
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        // Session membership check only; the transport lives with the peer
        self.inner.session_of(peer_id)?;
        self.media_server
            .transport_manager()
            .connect_transport(peer_id, role, dtls_parameters)
            .await
    }

    /// Creates a producer and announces it to the other peers of the session
    pub async fn produce(
        &self,
        peer_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: serde_json::Value,
    ) -> MediaResult<ProducerInfo> {
        let session_lock = self.inner.session_of(peer_id)?;
        let mut session = session_lock.write().await;

        let router = session.router.clone();
        let info = self
            .media_server
            .producer_manager()
            .produce(peer_id, router.as_ref(), kind, rtp_parameters, app_data)
            .await?;

        session.producers.insert(info.id, (peer_id.to_string(), kind));
        session.broadcast_except(
            peer_id,
            &ServerMessage::NewProducer {
                peer_id: peer_id.to_string(),
                producer_id: info.id,
                kind,
            },
        );

        Ok(info)
    }

    /// Creates a paused consumer for a producer of the session.
    ///
    /// Without a producer id, the producer is resolved only when exactly one
    /// producer of another peer exists in the session.
    pub async fn consume(
        &self,
        peer_id: &str,
        producer_id: Option<ProducerId>,
        peer_capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerInfo> {
        let session_lock = self.inner.session_of(peer_id)?;
        let session = session_lock.write().await;

        let producer_id = match producer_id {
            Some(id) => {
                if !session.producers.contains_key(&id) {
                    return Err(MediaError::ProducerNotFound(id.to_string()));
                }
                id
            }
            None => {
                let mut candidates = session
                    .producers
                    .iter()
                    .filter(|(_, (owner, _))| owner != peer_id)
                    .map(|(id, _)| *id);
                match (candidates.next(), candidates.next()) {
                    (Some(id), None) => id,
                    (None, _) => {
                        return Err(MediaError::InvalidRequest(
                            "producerId is required: no producer to consume in this session".to_string(),
                        ))
                    }
                    (Some(_), Some(_)) => {
                        return Err(MediaError::InvalidRequest(
                            "producerId is required: the session has several producers".to_string(),
                        ))
                    }
                }
            }
        };

        let router = session.router.clone();
        self.media_server
            .consumer_manager()
            .consume(peer_id, router.as_ref(), producer_id, peer_capabilities)
            .await
    }

    pub async fn resume_consumer(&self, peer_id: &str, consumer_id: ConsumerId) -> MediaResult<()> {
        self.inner.session_of(peer_id)?;
        self.media_server.consumer_manager().resume(peer_id, consumer_id).await
    }

    /// Closes one of the peer's own producers and tells the rest of the session
    pub async fn close_producer(&self, peer_id: &str, producer_id: ProducerId) -> MediaResult<()> {
        let session_lock = self.inner.session_of(peer_id)?;
        let mut session = session_lock.write().await;

        match session.producers.get(&producer_id) {
            Some((owner, _)) if owner == peer_id => {}
            _ => return Err(MediaError::ProducerNotFound(producer_id.to_string())),
        }

        self.media_server
            .producer_manager()
            .close_producer(peer_id, producer_id)
            .await?;

        session.producers.remove(&producer_id);
        session.broadcast_except(
            peer_id,
            &ServerMessage::ProducerClosed {
                peer_id: peer_id.to_string(),
                producer_id,
            },
        );
        Ok(())
    }

    /// Removes a peer: closes all of its transports (and with them its producers and
    /// consumers), tells the session, and releases the router once nobody is left.
    pub async fn remove_peer(&self, peer_id: &str) -> MediaResult<()> {
        let session_id = self
            .inner
            .peer_sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))?;

        let session_lock = {
            let sessions = self.inner.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.get(&session_id).cloned()
        };

        if let Some(session_lock) = &session_lock {
            let mut session = session_lock.write().await;
            session.peers.remove(peer_id);

            let owned: Vec<ProducerId> = session
                .producers
                .iter()
                .filter(|(_, (owner, _))| owner == peer_id)
                .map(|(id, _)| *id)
                .collect();
            for producer_id in owned {
                session.producers.remove(&producer_id);
                session.broadcast_except(
                    peer_id,
                    &ServerMessage::ProducerClosed {
                        peer_id: peer_id.to_string(),
                        producer_id,
                    },
                );
            }
            session.broadcast_except(peer_id, &ServerMessage::PeerLeft { peer_id: peer_id.to_string() });

            // Close media while holding the session lock so no request of this
            // session observes a half-removed peer
            if let Err(e) = self.media_server.transport_manager().remove_peer(peer_id).await {
                warn!("Failed to clean up media for peer {}: {}", peer_id, e);
            }

            info!("Peer {} left session {}", peer_id, session_id);

            if session.peers.is_empty() {
                // Still under the session lock: concurrent admissions wait here, then see
                // `closing` and retry against a new session with a new router
                session.closing = true;
                let released = self.media_server.router_manager().remove_router(&session_id).await;
                {
                    let mut sessions = self.inner.sessions.write().unwrap_or_else(|e| e.into_inner());
                    if sessions.get(&session_id).is_some_and(|lock| Arc::ptr_eq(lock, session_lock)) {
                        sessions.remove(&session_id);
                    }
                }
                released?;
                info!("Session {} is empty, released its router", session_id);
            }
        }

        Ok(())
    }

    /// Gets current session count
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets the number of admitted peers across all sessions
    pub fn peer_count(&self) -> usize {
        self.inner.peer_sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Samples the gauges rendered on `/metrics`
    pub async fn media_gauges(&self) -> MediaGauges {
        let entities = self.media_server.transport_manager().entity_counts().await;
        MediaGauges {
            sessions: self.session_count(),
            peers: self.peer_count(),
            routers: self.media_server.router_manager().router_count().await,
            transports: entities.transports,
            producers: entities.producers,
            consumers: entities.consumers,
            worker_alive: self.media_server.worker_manager().is_alive(),
        }
    }

    /// Gets the peer count of one session (brief read lock, non-blocking)
    pub fn peer_count_for_session(&self, session_id: &str) -> usize {
        let sessions = self.inner.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .and_then(|lock| lock.try_read().ok())
            .map(|session| session.peers.len())
            .unwrap_or(0)
    }

    /// Gracefully shuts down all sessions, then the media server
    pub async fn shutdown(&self) {
        info!("Shutting down all sessions...");

        let all_sessions: Vec<(String, Arc<TokioRwLock<Session>>)> = {
            let mut sessions = self.inner.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.drain().collect()
        };

        for (session_id, session_lock) in &all_sessions {
            let peer_ids: Vec<String> = session_lock.read().await.peers.keys().cloned().collect();
            for peer_id in &peer_ids {
                if let Err(e) = self.media_server.transport_manager().remove_peer(peer_id).await {
                    warn!("Failed to clean up media for peer {} during shutdown: {}", peer_id, e);
                }
            }
            info!("Shut down session {} ({} peers)", session_id, peer_ids.len());
        }
        self.inner.peer_sessions.write().unwrap_or_else(|e| e.into_inner()).clear();

        self.media_server.shutdown().await;
        info!("All sessions shut down ({} total)", all_sessions.len());
    }
}
