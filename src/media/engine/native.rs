#![forbid(unsafe_code)]

// Media engine backed by mediasoup workers.
// Parameters cross into mediasoup through their shared JSON shape. A mediasoup entity
// closes once its last handle is dropped, so every wrapper drops its handle in close()
// after closing the wrappers that depend on it.

use super::{
    Bag, CloseCallback, Consumer, ConsumerOptions, DeadCallback, DtlsStateCallback, EngineError,
    HandlerId, MediaEngine, Producer, ProducerOptions, Router, RouterOptions, WebRtcTransport,
    WebRtcTransportOptions, Worker, WorkerLogLevel, WorkerSettings,
};
use crate::media::data_structures::{
    ConsumerId, DtlsParameters, DtlsState, IceCandidate, IceParameters, ProducerId, RouterId,
    TransportId, WorkerId,
};
use crate::media::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use async_trait::async_trait;
use mediasoup::data_structures::DtlsState as MsDtlsState;
use mediasoup::prelude as ms;
use mediasoup::prelude::Transport as _;
use mediasoup::worker::WorkerLogLevel as MsWorkerLogLevel;
use mediasoup::worker_manager::WorkerManager as MsWorkerManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use tracing::{debug, error};

/// Re-reads a value as the equivalent mediasoup (or local) type
fn convert<T: Serialize, U: DeserializeOwned>(value: &T) -> Result<U, EngineError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| EngineError::TypeError(e.to_string()))
}

fn ms_kind(kind: MediaKind) -> ms::MediaKind {
    match kind {
        MediaKind::Audio => ms::MediaKind::Audio,
        MediaKind::Video => ms::MediaKind::Video,
    }
}

fn ms_log_level(level: WorkerLogLevel) -> MsWorkerLogLevel {
    match level {
        WorkerLogLevel::Debug => MsWorkerLogLevel::Debug,
        WorkerLogLevel::Warn => MsWorkerLogLevel::Warn,
        WorkerLogLevel::Error => MsWorkerLogLevel::Error,
        WorkerLogLevel::None => MsWorkerLogLevel::None,
    }
}

fn dtls_state(state: MsDtlsState) -> DtlsState {
    match state {
        MsDtlsState::New => DtlsState::New,
        MsDtlsState::Connecting => DtlsState::Connecting,
        MsDtlsState::Connected => DtlsState::Connected,
        MsDtlsState::Failed => DtlsState::Failed,
        MsDtlsState::Closed => DtlsState::Closed,
    }
}

/// One mediasoup listen info per configured address and enabled protocol
fn transport_options(options: &WebRtcTransportOptions) -> Result<ms::WebRtcTransportOptions, EngineError> {
    let mut protocols = Vec::with_capacity(2);
    if options.enable_udp {
        protocols.push(ms::Protocol::Udp);
    }
    if options.enable_tcp {
        protocols.push(ms::Protocol::Tcp);
    }

    let mut listen_infos = options.listen_infos.iter().flat_map(|info| {
        protocols.iter().map(move |protocol| ms::ListenInfo {
            protocol: *protocol,
            ip: info.ip,
            announced_address: info.announced_address.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        })
    });

    let first = listen_infos
        .next()
        .ok_or_else(|| EngineError::TypeError("no listen infos or protocols enabled".to_string()))?;
    let listen_infos = listen_infos.fold(ms::WebRtcTransportListenInfos::new(first), |infos, info| {
        infos.insert(info)
    });

    let mut transport_options = ms::WebRtcTransportOptions::new(listen_infos);
    transport_options.prefer_udp = options.prefer_udp;
    transport_options.initial_available_outgoing_bitrate = options.initial_available_outgoing_bitrate;
    Ok(transport_options)
}

/// Spawns mediasoup workers (threads of this process)
pub struct MediasoupEngine {
    manager: MsWorkerManager,
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: MsWorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(&self, settings: WorkerSettings) -> Result<Arc<dyn Worker>, EngineError> {
        if settings.rtc_port_range.is_empty() {
            return Err(EngineError::TypeError("empty RTC port range".to_string()));
        }

        let mut worker_settings = ms::WorkerSettings::default();
        worker_settings.log_level = ms_log_level(settings.log_level);
        worker_settings.rtc_port_range = settings.rtc_port_range.clone();

        let worker = self
            .manager
            .create_worker(worker_settings)
            .await
            .map_err(|e| EngineError::Exhausted(format!("failed to spawn worker: {e}")))?;
        let id: WorkerId = convert(&worker.id())?;

        let native = Arc::new_cyclic(|me: &Weak<NativeWorker>| {
            worker
                .on_dead({
                    let me = me.clone();
                    move |reason| {
                        let reason = match reason {
                            Ok(()) => "worker exited".to_string(),
                            Err(e) => e.to_string(),
                        };
                        if let Some(worker) = me.upgrade() {
                            worker.died(&reason);
                        }
                    }
                })
                .detach();

            NativeWorker {
                id,
                worker: StdMutex::new(Some(worker)),
                closed: AtomicBool::new(false),
                routers: StdMutex::new(HashMap::new()),
                dead_handlers: Bag::default(),
                me: me.clone(),
            }
        });

        debug!("mediasoup worker {} started (ports {:?})", id, settings.rtc_port_range);
        Ok(native)
    }
}

pub struct NativeWorker {
    id: WorkerId,
    worker: StdMutex<Option<ms::Worker>>,
    closed: AtomicBool,
    routers: StdMutex<HashMap<RouterId, Arc<NativeRouter>>>,
    dead_handlers: Bag<DeadCallback>,
    me: Weak<NativeWorker>,
}

impl NativeWorker {
    fn handle(&self) -> Result<ms::Worker, EngineError> {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("worker {}", self.id)))
    }

    fn died(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("mediasoup worker {} died: {}", self.id, reason);
        self.close_routers();
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.dead_handlers.call(|handler| handler(reason));
        self.dead_handlers.clear();
    }

    fn close_routers(&self) {
        let routers: Vec<Arc<NativeRouter>> = {
            let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
            routers.drain().map(|(_, r)| r).collect()
        };
        for router in routers {
            router.close();
        }
    }

    fn remove_router(&self, id: &RouterId) {
        self.routers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

#[async_trait]
impl Worker for NativeWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_router(&self, options: RouterOptions) -> Result<Arc<dyn Router>, EngineError> {
        let worker = self.handle()?;
        let media_codecs: Vec<ms::RtpCodecCapability> = convert(&options.media_codecs)?;

        let router = worker
            .create_router(ms::RouterOptions::new(media_codecs))
            .await
            .map_err(|e| EngineError::TypeError(format!("failed to create router: {e}")))?;
        let id: RouterId = convert(&router.id())?;
        let rtp_capabilities: RtpCapabilities = convert(router.rtp_capabilities())?;

        let native = Arc::new_cyclic(|me| NativeRouter {
            id,
            rtp_capabilities,
            router: StdMutex::new(Some(router)),
            closed: AtomicBool::new(false),
            worker: self.me.clone(),
            transports: StdMutex::new(HashMap::new()),
            producers: StdRwLock::new(HashMap::new()),
            close_handlers: Bag::default(),
            me: me.clone(),
        });

        if self.closed() {
            native.close();
            return Err(EngineError::Closed(format!("worker {}", self.id)));
        }
        self.routers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&native));

        debug!("mediasoup router {} created on worker {}", id, self.id);
        Ok(native)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_routers();
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.dead_handlers.clear();
    }

    fn on_dead(&self, callback: Arc<DeadCallback>) -> HandlerId {
        self.dead_handlers.add(callback)
    }
}

pub struct NativeRouter {
    id: RouterId,
    rtp_capabilities: RtpCapabilities,
    router: StdMutex<Option<ms::Router>>,
    closed: AtomicBool,
    worker: Weak<NativeWorker>,
    transports: StdMutex<HashMap<TransportId, Arc<NativeTransport>>>,
    producers: StdRwLock<HashMap<ProducerId, Weak<NativeProducer>>>,
    close_handlers: Bag<CloseCallback>,
    me: Weak<NativeRouter>,
}

impl NativeRouter {
    fn handle(&self) -> Result<ms::Router, EngineError> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("router {}", self.id)))
    }

    fn producer(&self, id: &ProducerId) -> Option<Arc<NativeProducer>> {
        self.producers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .and_then(Weak::upgrade)
    }

    fn remove_transport(&self, id: &TransportId) {
        self.transports.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    fn remove_producer(&self, id: &ProducerId) {
        self.producers.write().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

#[async_trait]
impl Router for NativeRouter {
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
        if !self.producer(producer_id).is_some_and(|p| !p.closed()) {
            return false;
        }
        let Ok(router) = self.handle() else {
            return false;
        };
        match (
            convert::<_, ms::ProducerId>(producer_id),
            convert::<_, ms::RtpCapabilities>(rtp_capabilities),
        ) {
            (Ok(producer_id), Ok(rtp_capabilities)) => router.can_consume(&producer_id, &rtp_capabilities),
            _ => false,
        }
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>, EngineError> {
        let router = self.handle()?;
        let transport = router
            .create_webrtc_transport(transport_options(&options)?)
            .await
            .map_err(|e| EngineError::Exhausted(format!("failed to create transport: {e}")))?;

        let id: TransportId = convert(&transport.id())?;
        let ice_parameters: IceParameters = convert(transport.ice_parameters())?;
        let ice_candidates: Vec<IceCandidate> = convert(transport.ice_candidates())?;
        let dtls_parameters: DtlsParameters = convert(&transport.dtls_parameters())?;

        let native = Arc::new_cyclic(|me: &Weak<NativeTransport>| {
            transport
                .on_dtls_state_change({
                    let me = me.clone();
                    move |state| {
                        if let Some(transport) = me.upgrade() {
                            transport.set_dtls_state(dtls_state(state));
                        }
                    }
                })
                .detach();

            NativeTransport {
                id,
                ice_parameters,
                ice_candidates,
                dtls_parameters,
                dtls_state: StdMutex::new(DtlsState::New),
                connected: AtomicBool::new(false),
                transport: StdMutex::new(Some(transport)),
                closed: AtomicBool::new(false),
                router: self.me.clone(),
                producers: StdMutex::new(HashMap::new()),
                consumers: StdMutex::new(HashMap::new()),
                close_handlers: Bag::default(),
                dtls_state_handlers: Bag::default(),
                me: me.clone(),
            }
        });

        if self.closed() {
            native.close();
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&native));

        debug!(
            "mediasoup transport {} created on router {} ({} candidates)",
            id,
            self.id,
            native.ice_candidates.len()
        );
        Ok(native)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<Arc<NativeTransport>> = {
            let mut transports = self.transports.lock().unwrap_or_else(|e| e.into_inner());
            transports.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            transport.close();
        }
        self.producers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.router.lock().unwrap_or_else(|e| e.into_inner()).take();
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

pub struct NativeTransport {
    id: TransportId,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    dtls_state: StdMutex<DtlsState>,
    connected: AtomicBool,
    transport: StdMutex<Option<ms::WebRtcTransport>>,
    closed: AtomicBool,
    router: Weak<NativeRouter>,
    producers: StdMutex<HashMap<ProducerId, Arc<NativeProducer>>>,
    consumers: StdMutex<HashMap<ConsumerId, Arc<NativeConsumer>>>,
    close_handlers: Bag<CloseCallback>,
    dtls_state_handlers: Bag<DtlsStateCallback>,
    me: Weak<NativeTransport>,
}

impl NativeTransport {
    fn handle(&self) -> Result<ms::WebRtcTransport, EngineError> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("transport {}", self.id)))
    }

    fn set_dtls_state(&self, state: DtlsState) {
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

    fn remove_producer(&self, id: &ProducerId) {
        self.producers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    fn remove_consumer(&self, id: &ConsumerId) {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

#[async_trait]
impl WebRtcTransport for NativeTransport {
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
        let transport = self.handle()?;
        dtls_parameters.validate().map_err(EngineError::TypeError)?;
        let remote = ms::WebRtcTransportRemoteParameters {
            dtls_parameters: convert(&dtls_parameters)?,
        };

        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidState("connect() already called".to_string()));
        }
        if let Err(e) = transport.connect(remote).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(EngineError::InvalidState(format!("connect failed: {e}")));
        }
        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>, EngineError> {
        let transport = self.handle()?;
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| EngineError::Closed(format!("router of transport {}", self.id)))?;

        let mut producer_options = ms::ProducerOptions::new(ms_kind(options.kind), convert(&options.rtp_parameters)?);
        producer_options.paused = options.paused;

        let producer = transport
            .produce(producer_options)
            .await
            .map_err(|e| EngineError::TypeError(format!("failed to produce: {e}")))?;
        let id: ProducerId = convert(&producer.id())?;
        let rtp_parameters: RtpParameters = convert(producer.rtp_parameters())?;

        let native = Arc::new(NativeProducer {
            id,
            kind: options.kind,
            rtp_parameters,
            producer: StdMutex::new(Some(producer)),
            closed: AtomicBool::new(false),
            router: Arc::downgrade(&router),
            transport: self.me.clone(),
            consumers: StdMutex::new(HashMap::new()),
            close_handlers: Bag::default(),
            transport_close_handlers: Bag::default(),
        });

        if self.closed() {
            native.close();
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        router
            .producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::downgrade(&native));
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&native));

        debug!("mediasoup producer {} ({}) created on transport {}", id, native.kind, self.id);
        Ok(native)
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn Consumer>, EngineError> {
        let transport = self.handle()?;
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

        let mut consumer_options = ms::ConsumerOptions::new(
            convert(&options.producer_id)?,
            convert(&options.rtp_capabilities)?,
        );
        consumer_options.paused = options.paused;

        let consumer = transport
            .consume(consumer_options)
            .await
            .map_err(|e| EngineError::TypeError(format!("failed to consume: {e}")))?;
        let id: ConsumerId = convert(&consumer.id())?;
        let rtp_parameters: RtpParameters = convert(consumer.rtp_parameters())?;

        let native = Arc::new(NativeConsumer {
            id,
            producer_id: producer.id,
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(options.paused),
            consumer: StdMutex::new(Some(consumer)),
            closed: AtomicBool::new(false),
            transport: self.me.clone(),
            producer: Arc::downgrade(&producer),
            close_handlers: Bag::default(),
            producer_close_handlers: Bag::default(),
            transport_close_handlers: Bag::default(),
        });

        if self.closed() || producer.closed() {
            native.close();
            return Err(EngineError::Closed(format!("consumer {}", id)));
        }
        producer
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&native));
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&native));

        debug!(
            "mediasoup consumer {} created for producer {} on transport {} (paused={})",
            id, producer.id, self.id, options.paused
        );
        Ok(native)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let producers: Vec<Arc<NativeProducer>> = {
            let mut producers = self.producers.lock().unwrap_or_else(|e| e.into_inner());
            producers.drain().map(|(_, p)| p).collect()
        };
        for producer in producers {
            producer.transport_closed();
        }
        let consumers: Vec<Arc<NativeConsumer>> = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.drain().map(|(_, c)| c).collect()
        };
        for consumer in consumers {
            consumer.transport_closed();
        }
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
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

pub struct NativeProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer: StdMutex<Option<ms::Producer>>,
    closed: AtomicBool,
    router: Weak<NativeRouter>,
    transport: Weak<NativeTransport>,
    consumers: StdMutex<HashMap<ConsumerId, Arc<NativeConsumer>>>,
    close_handlers: Bag<CloseCallback>,
    transport_close_handlers: Bag<CloseCallback>,
}

impl NativeProducer {
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
        let consumers: Vec<Arc<NativeConsumer>> = {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            consumers.drain().map(|(_, c)| c).collect()
        };
        for consumer in consumers {
            consumer.producer_closed();
        }
        self.producer.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.close_handlers.call(|handler| handler());
        self.close_handlers.clear();
        self.transport_close_handlers.clear();
    }

    fn remove_consumer(&self, id: &ConsumerId) {
        self.consumers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }
}

impl Producer for NativeProducer {
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

pub struct NativeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    consumer: StdMutex<Option<ms::Consumer>>,
    closed: AtomicBool,
    transport: Weak<NativeTransport>,
    producer: Weak<NativeProducer>,
    close_handlers: Bag<CloseCallback>,
    producer_close_handlers: Bag<CloseCallback>,
    transport_close_handlers: Bag<CloseCallback>,
}

impl NativeConsumer {
    fn handle(&self) -> Result<ms::Consumer, EngineError> {
        self.consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("consumer {}", self.id)))
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
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.close_handlers.call(|handler| handler());
        self.close_handlers.clear();
        self.producer_close_handlers.clear();
        self.transport_close_handlers.clear();
    }
}

#[async_trait]
impl Consumer for NativeConsumer {
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
        let consumer = self.handle()?;
        consumer
            .resume()
            .await
            .map_err(|e| EngineError::InvalidState(format!("failed to resume: {e}")))?;
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
