#![forbid(unsafe_code)]

// In-process media engine used by the unit tests.
// Keeps the full entity graph and its closure rules without touching the network:
// candidates come from the configured port range, DTLS completes on connect(),
// and "forwarding" is a packet counter per consumer.

use super::{
    Bag, CloseCallback, Consumer, ConsumerOptions, DeadCallback, DtlsStateCallback, EngineError,
    HandlerId, MediaEngine, Producer, ProducerOptions, Router, RouterOptions, WebRtcTransport,
    WebRtcTransportOptions, Worker, WorkerSettings,
};
use crate::media::capabilities;
use crate::media::data_structures::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate,
    IceCandidateTcpType, IceCandidateType, IceParameters, ProducerId, Protocol, RouterId,
    TransportId, WorkerId,
};
use crate::media::rtp_parameters::{
    HeaderExtensionDirection, MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension,
    RtpHeaderExtensionParameters, RtpParameters,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Payload types handed out when a codec has no (free) preferred payload type
const DYNAMIC_PAYLOAD_TYPES: RangeInclusive<u8> = 96..=127;

/// Header extensions every router advertises: (kind, uri, preferred id)
const SUPPORTED_HEADER_EXTENSIONS: [(MediaKind, &str, u16); 6] = [
    (MediaKind::Audio, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
    (MediaKind::Video, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
    (MediaKind::Audio, "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time", 4),
    (MediaKind::Video, "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time", 4),
    (MediaKind::Video, "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01", 5),
    (MediaKind::Audio, "urn:ietf:params:rtp-hdrext:ssrc-audio-level", 10),
];

/// Computes the capability descriptor of a router from its configured codecs.
///
/// The result only depends on the input, so every peer asking the same router
/// gets the same answer.
fn router_capabilities(media_codecs: &[RtpCodecCapability]) -> Result<RtpCapabilities, String> {
    let mut used_payload_types = HashSet::new();
    let mut dynamic = DYNAMIC_PAYLOAD_TYPES;
    let mut codecs = Vec::with_capacity(media_codecs.len());

    for codec in media_codecs {
        match MediaKind::from_mime_type(&codec.mime_type) {
            Some(kind) if kind == codec.kind => {}
            _ => {
                return Err(format!(
                    "codec {} does not match its kind {}",
                    codec.mime_type, codec.kind
                ))
            }
        }
        if codec.mime_type.to_ascii_lowercase().ends_with("/rtx") {
            return Err("RTX codecs cannot be configured directly".to_string());
        }
        if codec.clock_rate == 0 {
            return Err(format!("codec {} has no clock rate", codec.mime_type));
        }

        let payload_type = match codec.preferred_payload_type {
            Some(pt) if !used_payload_types.contains(&pt) => pt,
            _ => dynamic
                .find(|pt| !used_payload_types.contains(pt))
                .ok_or_else(|| "no dynamic payload types left".to_string())?,
        };
        used_payload_types.insert(payload_type);

        let mut finalized = codec.clone();
        finalized.preferred_payload_type = Some(payload_type);
        if finalized.kind == MediaKind::Audio && finalized.channels.is_none() {
            finalized.channels = Some(1);
        }
        codecs.push(finalized);
    }

    let header_extensions = SUPPORTED_HEADER_EXTENSIONS
        .iter()
        .map(|(kind, uri, id)| RtpHeaderExtension {
            kind: Some(*kind),
            uri: (*uri).to_string(),
            preferred_id: *id,
            preferred_encrypt: false,
            direction: HeaderExtensionDirection::SendRecv,
        })
        .collect();

    Ok(RtpCapabilities { codecs, header_extensions })
}

/// Pure compatibility check between a producer's stream and a peer's capabilities
fn can_consume(kind: MediaKind, producer_parameters: &RtpParameters, peer_capabilities: &RtpCapabilities) -> bool {
    producer_parameters
        .media_codec()
        .map(|codec| capabilities::find_capability(peer_capabilities, kind, codec).is_some())
        .unwrap_or(false)
}

/// Builds the parameters a consumer sends to its peer: one codec, one encoding.
///
/// Returns `None` when the peer cannot receive the producer's codec.
fn consumer_rtp_parameters(
    kind: MediaKind,
    producer_parameters: &RtpParameters,
    router_capabilities: &RtpCapabilities,
    peer_capabilities: &RtpCapabilities,
    ssrc: u32,
) -> Option<RtpParameters> {
    let producer_codec = producer_parameters.media_codec()?;
    let peer_codec = capabilities::find_capability(peer_capabilities, kind, producer_codec)?;
    let router_codec = capabilities::find_capability(router_capabilities, kind, producer_codec)?;

    let rtcp_feedback: Vec<RtcpFeedback> = router_codec
        .rtcp_feedback
        .iter()
        .filter(|fb| peer_codec.rtcp_feedback.contains(fb))
        .cloned()
        .collect();

    let codec = RtpCodecParameters {
        mime_type: router_codec.mime_type.clone(),
        payload_type: peer_codec
            .preferred_payload_type
            .or(router_codec.preferred_payload_type)
            .unwrap_or(producer_codec.payload_type),
        clock_rate: router_codec.clock_rate,
        channels: router_codec.channels,
        parameters: producer_codec.parameters.clone(),
        rtcp_feedback,
    };

    let header_extensions = router_capabilities
        .header_extensions
        .iter()
        .filter(|ext| ext.kind == Some(kind))
        .filter_map(|ext| {
            peer_capabilities
                .header_extensions
                .iter()
                .find(|peer_ext| peer_ext.uri == ext.uri && peer_ext.kind.map_or(true, |k| k == kind))
                .map(|peer_ext| RtpHeaderExtensionParameters {
                    uri: ext.uri.clone(),
                    id: peer_ext.preferred_id,
                    encrypt: false,
                })
        })
        .collect();

    Some(RtpParameters {
        mid: None,
        codecs: vec![codec],
        header_extensions,
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(ssrc),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: producer_parameters.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

/// Lookup tables so callers (and tests) can reach concrete entities by id
#[derive(Default)]
struct Registry {
    workers: StdMutex<Vec<Weak<LocalWorker>>>,
    transports: StdRwLock<HashMap<TransportId, Weak<LocalTransport>>>,
    producers: StdRwLock<HashMap<ProducerId, Weak<LocalProducer>>>,
    consumers: StdRwLock<HashMap<ConsumerId, Weak<LocalConsumer>>>,
}

/// In-process engine
#[derive(Clone, Default)]
pub struct LocalEngine {
    registry: Arc<Registry>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers that are still alive
    pub fn workers(&self) -> Vec<Arc<LocalWorker>> {
        let workers = self.registry.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.iter().filter_map(Weak::upgrade).filter(|w| !w.closed()).collect()
    }

    pub fn transport(&self, id: &TransportId) -> Option<Arc<LocalTransport>> {
        let transports = self.registry.transports.read().unwrap_or_else(|e| e.into_inner());
        transports.get(id).and_then(Weak::upgrade)
    }

    pub fn producer(&self, id: &ProducerId) -> Option<Arc<LocalProducer>> {
        let producers = self.registry.producers.read().unwrap_or_else(|e| e.into_inner());
        producers.get(id).and_then(Weak::upgrade)
    }

    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<LocalConsumer>> {
        let consumers = self.registry.consumers.read().unwrap_or_else(|e| e.into_inner());
        consumers.get(id).and_then(Weak::upgrade)
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(&self, settings: WorkerSettings) -> Result<Arc<dyn Worker>, EngineError> {
        if settings.rtc_port_range.is_empty() {
            return Err(EngineError::TypeError("empty RTC port range".to_string()));
        }

        let worker = Arc::new_cyclic(|me| LocalWorker {
            id: WorkerId::new(),
            pid: std::process::id(),
            settings,
            closed: AtomicBool::new(false),
            next_port: AtomicU32::new(0),
            routers: StdMutex::new(HashMap::new()),
            dead_handlers: Bag::default(),
            registry: Arc::clone(&self.registry),
            me: me.clone(),
        });

        {
            let mut workers = self.registry.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.retain(|w| w.strong_count() > 0);
            workers.push(Arc::downgrade(&worker));
        }

        debug!("Local worker {} started (ports {:?})", worker.id, worker.settings.rtc_port_range);
        Ok(worker)
    }
}

fn random_u32() -> u32 {
    let bytes = Uuid::new_v4();
    let b = bytes.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn random_fingerprint() -> DtlsFingerprint {
    let value = Uuid::new_v4()
        .as_bytes()
        .iter()
        .chain(Uuid::new_v4().as_bytes().iter())
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

pub struct LocalWorker {
    id: WorkerId,
    pid: u32,
    settings: WorkerSettings,
    closed: AtomicBool,
    next_port: AtomicU32,
    routers: StdMutex<HashMap<RouterId, Arc<LocalRouter>>>,
    dead_handlers: Bag<DeadCallback>,
    registry: Arc<Registry>,
    me: Weak<LocalWorker>,
}

impl LocalWorker {
    /// Simulates the worker process dying underneath the server
    pub fn kill(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Local worker {} died: {}", self.id, reason);
        self.close_routers();
        self.dead_handlers.call(|handler| handler(reason));
        self.dead_handlers.clear();
    }

    fn close_routers(&self) {
        let routers: Vec<Arc<LocalRouter>> = {
            let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
            routers.drain().map(|(_, r)| r).collect()
        };
        for router in routers {
            router.close();
        }
    }

    fn allocate_port(&self) -> u16 {
        let start = *self.settings.rtc_port_range.start() as u32;
        let span = *self.settings.rtc_port_range.end() as u32 - start + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        (start + offset) as u16
    }

    fn remove_router(&self, id: &RouterId) {
        let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers.remove(id);
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_router(&self, options: RouterOptions) -> Result<Arc<dyn Router>, EngineError> {
        if self.closed() {
            return Err(EngineError::Closed(format!("worker {}", self.id)));
        }

        let rtp_capabilities =
            router_capabilities(&options.media_codecs).map_err(EngineError::TypeError)?;

        let router = Arc::new_cyclic(|me| LocalRouter {
            id: RouterId::new(),
            rtp_capabilities,
            closed: AtomicBool::new(false),
            worker: self.me.clone(),
            transports: StdMutex::new(HashMap::new()),
            producers: StdRwLock::new(HashMap::new()),
            close_handlers: Bag::default(),
            registry: Arc::clone(&self.registry),
            me: me.clone(),
        });

        self.routers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(router.id, Arc::clone(&router));

        debug!("Local router {} created on worker {}", router.id, self.id);
        Ok(router)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_routers();
        self.dead_handlers.clear();
    }

    fn on_dead(&self, callback: Arc<DeadCallback>) -> HandlerId {
        self.dead_handlers.add(callback)
    }
}

pub struct LocalRouter {
    id: RouterId,
    rtp_capabilities: RtpCapabilities,
    closed: AtomicBool,
    worker: Weak<LocalWorker>,
    transports: StdMutex<HashMap<TransportId, Arc<LocalTransport>>>,
    producers: StdRwLock<HashMap<ProducerId, Arc<LocalProducer>>>,
    close_handlers: Bag<CloseCallback>,
    registry: Arc<Registry>,
    me: Weak<LocalRouter>,
}

impl LocalRouter {
    /// Number of producers currently routable
    pub fn producer_count(&self) -> usize {
        self.producers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn producer(&self, id: &ProducerId) -> Option<Arc<LocalProducer>> {
        self.producers.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    fn remove_transport(&self, id: &TransportId) {
        self.transports.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    fn remove_producer(&self, id: &ProducerId) {
        self.producers.write().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        if self.closed() {
            return false;
        }
        match self.producer(producer_id) {
            Some(producer) if !producer.closed() => {
                can_consume(producer.kind, &producer.rtp_parameters, rtp_capabilities)
            }
            _ => false,
        }
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>, EngineError> {
        if self.closed() {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        if options.listen_infos.is_empty() {
            return Err(EngineError::TypeError("no listen infos given".to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::TypeError("neither UDP nor TCP enabled".to_string()));
        }
        let worker = self
            .worker
            .upgrade()
            .ok_or_else(|| EngineError::Closed(format!("worker of router {}", self.id)))?;

        let mut ice_candidates = Vec::new();
        for listen_info in &options.listen_infos {
            let address = listen_info
                .announced_address
                .clone()
                .unwrap_or_else(|| listen_info.ip.to_string());
            if options.enable_udp {
                ice_candidates.push(IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: if options.prefer_udp { 1_076_302_079 } else { 1_076_276_479 },
                    address: address.clone(),
                    protocol: Protocol::Udp,
                    port: worker.allocate_port(),
                    candidate_type: IceCandidateType::Host,
                    tcp_type: None,
                });
            }
            if options.enable_tcp {
                ice_candidates.push(IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: if options.prefer_udp { 1_076_276_479 } else { 1_076_302_079 },
                    address,
                    protocol: Protocol::Tcp,
                    port: worker.allocate_port(),
                    candidate_type: IceCandidateType::Host,
                    tcp_type: Some(IceCandidateTcpType::Passive),
                });
            }
        }

        let ufrag = Uuid::new_v4().simple().to_string();
        let transport = Arc::new_cyclic(|me| LocalTransport {
            id: TransportId::new(),
            ice_parameters: IceParameters {
                username_fragment: ufrag[..16].to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![random_fingerprint()],
            },
            dtls_state: StdMutex::new(DtlsState::New),
            remote_dtls_parameters: StdMutex::new(None),
            closed: AtomicBool::new(false),
            router: self.me.clone(),
            producers: StdMutex::new(HashMap::new()),
            consumers: StdMutex::new(HashMap::new()),
            close_handlers: Bag::default(),
            dtls_state_handlers: Bag::default(),
            registry: Arc::clone(&self.registry),
            me: me.clone(),
        });

        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transport.id, Arc::clone(&transport));
        self.registry
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transport.id, Arc::downgrade(&transport));

        debug!("Local transport {} created on router {}", transport.id, self.id);
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<Arc<LocalTransport>> = {
            let mut transports = self.transports.lock().unwrap_or_else(|e| e.into_inner());
            transports.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            transport.close();
        }
        self.producers.write().unwrap_or_else(|e| e.into_inner()).clear();
        if let Some(worker) = self.worker.upgrade() {
            worker.remove_router(&self.id);
        }
        self.close_handlers.call(|handler| handler());
        self.close_handlers.clear();
    }

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId {
        self.close_handlers.add(callback)
    }
}

pub struct LocalTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    dtls_state: StdMutex<DtlsState>,
    remote_dtls_parameters: StdMutex<Option<DtlsParameters>>,
    closed: AtomicBool,
    router: Weak<LocalRouter>,
    producers: StdMutex<HashMap<ProducerId, Arc<LocalProducer>>>,
    consumers: StdMutex<HashMap<ConsumerId, Arc<LocalConsumer>>>,
    close_handlers: Bag<CloseCallback>,
    dtls_state_handlers: Bag<DtlsStateCallback>,
    registry: Arc<Registry>,
    me: Weak<LocalTransport>,
}

impl LocalTransport {
    /// Moves the DTLS state machine, as the remote endpoint would
    pub fn set_dtls_state(&self, state: DtlsState) {
        if self.closed() {
            return;
        }
        {
            let mut current = self.dtls_state.lock().unwrap_or_else(|e| e.into_inner());
            if *current == state {
                return;
            }
            *current = state;
        }
        self.dtls_state_handlers.call(|handler| handler(state));
    }

    /// Parameters the remote side connected with, if any
    pub fn remote_dtls_parameters(&self) -> Option<DtlsParameters> {
        self.remote_dtls_parameters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn remove_producer(&self, id: &ProducerId) {
        self.producers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    fn remove_consumer(&self, id: &ConsumerId) {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

#[async_trait]
impl WebRtcTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn dtls_state(&self) -> DtlsState {
        *self.dtls_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        dtls_parameters.validate().map_err(EngineError::TypeError)?;
        {
            let mut remote = self.remote_dtls_parameters.lock().unwrap_or_else(|e| e.into_inner());
            if remote.is_some() {
                return Err(EngineError::InvalidState("connect() already called".to_string()));
            }
            *remote = Some(dtls_parameters);
        }
        self.set_dtls_state(DtlsState::Connecting);
        self.set_dtls_state(DtlsState::Connected);
        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>, EngineError> {
        if self.closed() {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| EngineError::Closed(format!("router of transport {}", self.id)))?;

        capabilities::validate_producer_parameters(options.kind, &options.rtp_parameters, &router.rtp_capabilities)
            .map_err(EngineError::TypeError)?;

        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            closed: AtomicBool::new(false),
            router: Arc::downgrade(&router),
            transport: self.me.clone(),
            consumers: StdMutex::new(HashMap::new()),
            received_packets: AtomicU64::new(0),
            close_handlers: Bag::default(),
            transport_close_handlers: Bag::default(),
        });

        router
            .producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.id, Arc::clone(&producer));
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.id, Arc::clone(&producer));
        self.registry
            .producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.id, Arc::downgrade(&producer));

        debug!("Local producer {} ({}) created on transport {}", producer.id, producer.kind, self.id);
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, EngineError> {
        if self.closed() {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| EngineError::Closed(format!("router of transport {}", self.id)))?;
        let producer = router
            .producer(&options.producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {}", options.producer_id)))?;
        if producer.closed() {
            return Err(EngineError::Closed(format!("producer {}", producer.id)));
        }

        let rtp_parameters = consumer_rtp_parameters(
            producer.kind,
            &producer.rtp_parameters,
            &router.rtp_capabilities,
            &options.rtp_capabilities,
            random_u32(),
        )
        .ok_or_else(|| EngineError::TypeError(format!("cannot consume producer {}", producer.id)))?;

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            producer_id: producer.id,
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            transport: self.me.clone(),
            producer: Arc::downgrade(&producer),
            forwarded_packets: AtomicU64::new(0),
            close_handlers: Bag::default(),
            producer_close_handlers: Bag::default(),
            transport_close_handlers: Bag::default(),
        });

        producer
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(consumer.id, Arc::clone(&consumer));
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(consumer.id, Arc::clone(&consumer));
        self.registry
            .consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(consumer.id, Arc::downgrade(&consumer));

        debug!(
            "Local consumer {} created for producer {} on transport {} (paused={})",
            consumer.id, producer.id, self.id, options.paused
        );
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let producers: Vec<Arc<LocalProducer>> = {
            let mut producers = self.producers.lock().unwrap_or_else(|e| e.into_inner());
            producers.drain().map(|(_, p)| p).collect()
        };
        for producer in producers {
            producer.transport_closed();
        }
        let consumers: Vec<Arc<LocalConsumer>> = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.drain().map(|(_, c)| c).collect()
        };
        for consumer in consumers {
            consumer.transport_closed();
        }
        if let Some(router) = self.router.upgrade() {
            router.remove_transport(&self.id);
        }
        self.close_handlers.call(|handler| handler());
        self.close_handlers.clear();
        self.dtls_state_handlers.clear();
    }

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId {
        self.close_handlers.add(callback)
    }

    fn on_dtls_state_change(&self, callback: Arc<DtlsStateCallback>) -> HandlerId {
        self.dtls_state_handlers.add(callback)
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
    router: Weak<LocalRouter>,
    transport: Weak<LocalTransport>,
    consumers: StdMutex<HashMap<ConsumerId, Arc<LocalConsumer>>>,
    received_packets: AtomicU64,
    close_handlers: Bag<CloseCallback>,
    transport_close_handlers: Bag<CloseCallback>,
}

impl LocalProducer {
    /// Feeds RTP packets in from the browser. Returns how many consumers forwarded them.
    pub fn send_rtp(&self, packets: u64) -> usize {
        if self.closed() {
            return 0;
        }
        self.received_packets.fetch_add(packets, Ordering::Relaxed);
        let consumers: Vec<Arc<LocalConsumer>> = {
            let consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.values().cloned().collect()
        };
        consumers.iter().filter(|c| c.forward(packets)).count()
    }

    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport_close_handlers.call(|handler| handler());
        self.finish_close();
    }

    fn finish_close(&self) {
        if let Some(router) = self.router.upgrade() {
            router.remove_producer(&self.id);
        }
        let consumers: Vec<Arc<LocalConsumer>> = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.drain().map(|(_, c)| c).collect()
        };
        for consumer in consumers {
            consumer.producer_closed();
        }
        self.close_handlers.call(|handler| handler());
        self.close_handlers.clear();
        self.transport_close_handlers.clear();
    }

    fn remove_consumer(&self, id: &ConsumerId) {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_producer(&self.id);
        }
        self.finish_close();
    }

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId {
        self.close_handlers.add(callback)
    }

    fn on_transport_close(&self, callback: Arc<CloseCallback>) -> HandlerId {
        self.transport_close_handlers.add(callback)
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    transport: Weak<LocalTransport>,
    producer: Weak<LocalProducer>,
    forwarded_packets: AtomicU64,
    close_handlers: Bag<CloseCallback>,
    producer_close_handlers: Bag<CloseCallback>,
    transport_close_handlers: Bag<CloseCallback>,
}

impl LocalConsumer {
    /// Packets sent towards the browser so far
    pub fn forwarded_packets(&self) -> u64 {
        self.forwarded_packets.load(Ordering::Relaxed)
    }

    fn forward(&self, packets: u64) -> bool {
        if self.closed() || self.paused() {
            return false;
        }
        self.forwarded_packets.fetch_add(packets, Ordering::Relaxed);
        true
    }

    fn producer_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_consumer(&self.id);
        }
        self.producer_close_handlers.call(|handler| handler());
        self.finish_close();
    }

    fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(producer) = self.producer.upgrade() {
            producer.remove_consumer(&self.id);
        }
        self.transport_close_handlers.call(|handler| handler());
        self.finish_close();
    }

    fn finish_close(&self) {
        self.close_handlers.call(|handler| handler());
        self.close_handlers.clear();
        self.producer_close_handlers.clear();
        self.transport_close_handlers.clear();
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed() {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_consumer(&self.id);
        }
        if let Some(producer) = self.producer.upgrade() {
            producer.remove_consumer(&self.id);
        }
        self.finish_close();
    }

    fn on_close(&self, callback: Arc<CloseCallback>) -> HandlerId {
        self.close_handlers.add(callback)
    }

    fn on_producer_close(&self, callback: Arc<CloseCallback>) -> HandlerId {
        self.producer_close_handlers.add(callback)
    }

    fn on_transport_close(&self, callback: Arc<CloseCallback>) -> HandlerId {
        self.transport_close_handlers.add(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::{MediaConfig, RouterConfig};
    use crate::media::testing;
    use serde_json::Value;

    async fn router(engine: &LocalEngine) -> (Arc<dyn Worker>, Arc<dyn Router>) {
        let config = MediaConfig::default();
        let worker = engine.create_worker(config.worker_config.to_worker_settings()).await.unwrap();
        let router = worker.create_router(config.router_config.to_router_options()).await.unwrap();
        (worker, router)
    }

    async fn transport(router: &Arc<dyn Router>) -> Arc<dyn WebRtcTransport> {
        let options = MediaConfig::default().webrtc_transport_config.to_transport_options();
        router.create_webrtc_transport(options).await.unwrap()
    }

    #[tokio::test]
    async fn test_transport_parameters() {
        let engine = LocalEngine::new();
        let (_worker, router) = router(&engine).await;
        let transport = transport(&router).await;

        assert!(transport.ice_parameters().ice_lite);
        assert_eq!(transport.ice_candidates().len(), 2);
        assert!(transport
            .ice_candidates()
            .iter()
            .all(|c| (40000..=49999).contains(&c.port)));
        assert!(transport.dtls_parameters().validate().is_ok());
        assert_eq!(transport.dtls_state(), DtlsState::New);
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let engine = LocalEngine::new();
        let (_worker, router) = router(&engine).await;
        let transport = transport(&router).await;

        transport.connect(testing::dtls_parameters()).await.unwrap();
        assert_eq!(transport.dtls_state(), DtlsState::Connected);

        let err = transport.connect(testing::dtls_parameters()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        assert_eq!(transport.dtls_state(), DtlsState::Connected);
    }

    #[tokio::test]
    async fn test_paused_consumer_forwards_nothing() {
        let engine = LocalEngine::new();
        let (_worker, router) = router(&engine).await;
        let send = transport(&router).await;
        let recv = transport(&router).await;

        let producer = send
            .produce(ProducerOptions::new(MediaKind::Video, testing::vp8_rtp_parameters()))
            .await
            .unwrap();
        let mut options = ConsumerOptions::new(producer.id(), testing::browser_capabilities());
        options.paused = true;
        let consumer = recv.consume(options).await.unwrap();

        let local_producer = engine.producer(&producer.id()).unwrap();
        let local_consumer = engine.consumer(&consumer.id()).unwrap();

        assert_eq!(local_producer.send_rtp(10), 0);
        assert_eq!(local_consumer.forwarded_packets(), 0);

        consumer.resume().await.unwrap();
        assert_eq!(local_producer.send_rtp(10), 1);
        assert_eq!(local_consumer.forwarded_packets(), 10);
    }

    #[tokio::test]
    async fn test_transport_close_cascades() {
        let engine = LocalEngine::new();
        let (_worker, router) = router(&engine).await;
        let send = transport(&router).await;
        let recv = transport(&router).await;

        let producer = send
            .produce(ProducerOptions::new(MediaKind::Video, testing::vp8_rtp_parameters()))
            .await
            .unwrap();
        let consumer = recv
            .consume(ConsumerOptions::new(producer.id(), testing::browser_capabilities()))
            .await
            .unwrap();

        let producer_closed_seen = Arc::new(AtomicBool::new(false));
        consumer
            .on_producer_close(Arc::new({
                let seen = Arc::clone(&producer_closed_seen);
                move || seen.store(true, Ordering::SeqCst)
            }))
            .detach();

        send.close();

        assert!(producer.closed());
        assert!(consumer.closed());
        assert!(producer_closed_seen.load(Ordering::SeqCst));
        assert!(!recv.closed());
        assert!(!router.can_consume(&producer.id(), &testing::browser_capabilities()));
    }

    #[tokio::test]
    async fn test_produce_rejects_unknown_codec() {
        let engine = LocalEngine::new();
        let (_worker, router) = router(&engine).await;
        let send = transport(&router).await;

        let mut params = testing::vp8_rtp_parameters();
        params.codecs[0].mime_type = "video/AV1".to_string();
        let err = send
            .produce(ProducerOptions::new(MediaKind::Video, params))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::TypeError(_)));
    }

    #[tokio::test]
    async fn test_worker_kill_closes_routers_and_notifies() {
        let engine = LocalEngine::new();
        let (worker, router) = router(&engine).await;
        let reason = Arc::new(StdMutex::new(None::<String>));

        let _handler = worker.on_dead(Arc::new({
            let reason = Arc::clone(&reason);
            move |r: &str| {
                *reason.lock().unwrap() = Some(r.to_string());
            }
        }));

        engine.workers()[0].kill("segfault");

        assert!(worker.closed());
        assert!(router.closed());
        assert_eq!(reason.lock().unwrap().as_deref(), Some("segfault"));
        assert!(engine.workers().is_empty());
    }

    #[test]
    fn test_default_router_capabilities() {
        let caps = router_capabilities(&RouterConfig::default().media_codecs).unwrap();

        let opus = caps.codecs.iter().find(|c| c.mime_type == "audio/opus").unwrap();
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.channels, Some(2));
        assert!(opus.preferred_payload_type.is_some());

        let vp8 = caps.codecs.iter().find(|c| c.mime_type == "video/VP8").unwrap();
        assert_eq!(vp8.clock_rate, 90000);
        assert_eq!(vp8.parameters.get("x-google-start-bitrate"), Some(&Value::from(1000)));
        assert!(!caps.header_extensions.is_empty());
    }

    #[test]
    fn test_router_capabilities_are_deterministic() {
        let codecs = RouterConfig::default().media_codecs;
        let first = router_capabilities(&codecs).unwrap();
        for _ in 0..10 {
            assert_eq!(router_capabilities(&codecs).unwrap(), first);
        }
    }

    #[test]
    fn test_payload_type_collisions_get_dynamic_types() {
        let mut codecs = RouterConfig::default().media_codecs;
        for codec in &mut codecs {
            codec.preferred_payload_type = Some(100);
        }
        let caps = router_capabilities(&codecs).unwrap();
        let pts: HashSet<_> = caps.codecs.iter().map(|c| c.preferred_payload_type).collect();
        assert_eq!(pts.len(), caps.codecs.len());
    }

    #[test]
    fn test_router_capabilities_reject_kind_mismatch() {
        let mut codecs = RouterConfig::default().media_codecs;
        codecs[0].kind = MediaKind::Video;
        assert!(router_capabilities(&codecs).is_err());
    }

    #[test]
    fn test_can_consume_is_stable_and_checks_codecs() {
        let peer = testing::browser_capabilities();
        let vp8 = testing::vp8_rtp_parameters();

        let first = can_consume(MediaKind::Video, &vp8, &peer);
        assert!(first);
        for _ in 0..10 {
            assert_eq!(can_consume(MediaKind::Video, &vp8, &peer), first);
        }

        let audio_only = RtpCapabilities {
            codecs: peer.codecs.iter().filter(|c| c.kind == MediaKind::Audio).cloned().collect(),
            header_extensions: vec![],
        };
        assert!(!can_consume(MediaKind::Video, &vp8, &audio_only));
        assert!(!can_consume(MediaKind::Video, &vp8, &RtpCapabilities::default()));
    }

    #[test]
    fn test_consumer_rtp_parameters_are_single_encoding() {
        let router_caps = router_capabilities(&RouterConfig::default().media_codecs).unwrap();
        let peer = testing::browser_capabilities();

        let params = consumer_rtp_parameters(
            MediaKind::Video,
            &testing::vp8_rtp_parameters(),
            &router_caps,
            &peer,
            1234,
        )
        .unwrap();

        assert_eq!(params.codecs.len(), 1);
        assert_eq!(params.codecs[0].mime_type, "video/VP8");
        assert_eq!(params.encodings.len(), 1);
        assert_eq!(params.encodings[0].ssrc, Some(1234));
        assert!(params
            .header_extensions
            .iter()
            .all(|ext| !ext.uri.contains("ssrc-audio-level")));
    }
}
