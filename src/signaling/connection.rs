#![forbid(unsafe_code)]

// WebSocket connection handler for individual peers

use super::protocol::{self, ClientMessage, ServerMessage};
use crate::media::types::{ErrorCategory, MediaResult};
use crate::metrics::ServerMetrics;
use crate::session::SessionRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound queue capacity per peer, 640ms of burst at the rate limit.
/// Notifications beyond it are dropped; responses wait for room.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout: close the connection if no message arrives within this duration,
/// so idle sockets cannot hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const WELCOME_MESSAGE: &str = "Connected to the SFU signaling server";

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
/// Never waits; a full queue drops the message with a warning.
fn send_json(
    sender: &mpsc::Sender<Arc<String>>,
    request_id: Option<u64>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let json = Arc::new(protocol::encode(request_id, msg)?);
    if let Err(e) = sender.try_send(json) {
        if let TrySendError::Full(_) = e {
            warn!("Outbound queue full, dropping {} message", msg.kind());
        }
        return Err(anyhow::anyhow!("{e}"));
    }
    Ok(())
}

/// Sends the direct response to a request, waiting for queue space.
/// Fails only once the send task is gone.
async fn send_response(
    sender: &mpsc::Sender<Arc<String>>,
    request_id: Option<u64>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let json = Arc::new(protocol::encode(request_id, msg)?);
    sender.send(json).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    session_id: Option<String>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", peer_id);

    let _conn_guard = metrics.track_connection();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this peer
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let peer_id_clone = peer_id.clone();

    // Spawn task to send messages to the peer
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for peer: {}", peer_id_clone);
    });

    // Identity first, before any negotiation
    let _ = send_json(&tx, None, &ServerMessage::Welcome { message: WELCOME_MESSAGE.to_string() });

    let admitted = match registry.admit(session_id, &peer_id, tx.clone()).await {
        Ok(session_id) => {
            let _ = send_json(&tx, None, &ServerMessage::ConnectionSuccess {
                peer_id: peer_id.clone(),
                session_id,
            });
            true
        }
        Err(e) => {
            warn!("Failed to admit peer {}: {}", peer_id, e);
            metrics.inc_admission_failures();
            let _ = send_json(&tx, None, &ServerMessage::error(&e));
            false
        }
    };

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    while admitted {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                let (request_id, parsed) = protocol::parse_request(&text);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    metrics.inc_rate_limited();
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for peer {}", peer_id);
                        let _ = send_json(&tx, request_id, &ServerMessage::Error {
                            category: ErrorCategory::PreconditionFailed,
                            message: format!("Rate limit exceeded: max {} messages/second", RATE_LIMIT_REFILL_RATE),
                        });
                    }
                    continue;
                }

                match parsed {
                    Ok(client_msg) => {
                        let kind = client_msg.kind();
                        let start = Instant::now();
                        let result = handle_client_message(client_msg, &peer_id, &registry).await;
                        metrics.record_request(kind, result.as_ref().map(|_| ()).map_err(|e| e.category()), start.elapsed());

                        let response = match result {
                            Ok(response) => response,
                            Err(e) => {
                                warn!("{} from peer {} failed: {}", kind, peer_id, e);
                                ServerMessage::error(&e)
                            }
                        };

                        if let Err(e) = send_response(&tx, request_id, &response).await {
                            // Channel closed means the send task has exited
                            if tx.is_closed() {
                                break;
                            }
                            warn!("Failed to send response to peer {}: {}", peer_id, e);
                        }
                    }
                    Err(e) => {
                        warn!("Malformed message from peer {}: {}", peer_id, e);
                        metrics.record_unparsed();
                        if send_response(&tx, request_id, &ServerMessage::malformed(e)).await.is_err() && tx.is_closed() {
                            break;
                        }
                    }
                }
            }
            Message::Close(_) => {
                info!("Peer {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from peer {}", peer_id);
            }
        }
    }

    // Disconnect cascades: transports, producers, consumers, then the router if unused
    if admitted {
        if let Err(e) = registry.remove_peer(&peer_id).await {
            warn!("Error removing peer {}: {}", peer_id, e);
        }
    }

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for peer: {}", peer_id);
}

/// Dispatches one request and builds its direct response
async fn handle_client_message(
    msg: ClientMessage,
    peer_id: &str,
    registry: &SessionRegistry,
) -> MediaResult<ServerMessage> {
    match msg {
        ClientMessage::GetCapabilities => {
            let rtp_capabilities = registry.get_capabilities(peer_id).await?;
            Ok(ServerMessage::Capabilities { rtp_capabilities })
        }

        ClientMessage::CreateTransport { role } => {
            let info = registry.create_transport(peer_id, role).await?;
            debug!("Created {} transport {} for peer {}", role, info.id, peer_id);
            Ok(ServerMessage::transport_created(role, info))
        }

        ClientMessage::ConnectTransport { role, dtls_parameters } => {
            registry.connect_transport(peer_id, role, dtls_parameters).await?;
            debug!("Connected {} transport for peer {}", role, peer_id);
            Ok(ServerMessage::TransportConnected { role })
        }

        ClientMessage::Produce { kind, rtp_parameters, app_data } => {
            let info = registry.produce(peer_id, kind, rtp_parameters, app_data).await?;
            Ok(ServerMessage::ProducerCreated {
                producer_id: info.id,
                kind: info.kind,
            })
        }

        ClientMessage::Consume { producer_id, peer_capabilities } => {
            let info = registry.consume(peer_id, producer_id, peer_capabilities).await?;
            Ok(ServerMessage::consumer_created(info))
        }

        ClientMessage::ResumeConsumer { consumer_id } => {
            registry.resume_consumer(peer_id, consumer_id).await?;
            Ok(ServerMessage::ConsumerResumed { consumer_id })
        }

        ClientMessage::CloseProducer { producer_id } => {
            registry.close_producer(peer_id, producer_id).await?;
            Ok(ServerMessage::ProducerClosed {
                peer_id: peer_id.to_string(),
                producer_id,
            })
        }
    }
}
