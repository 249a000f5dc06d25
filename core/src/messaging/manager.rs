//! High-level messaging service integrating transport, sessions and the offline queue

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::crypto::PreKeyBundle;
use crate::messaging::handler::{HandlerError, Incoming, MessageHandler};
use crate::messaging::protocol::{Envelope, Message, MessageType, ProtocolError};
use crate::messaging::transport::{Transport, TransportError, TransportEvent};
use crate::queue::{EnqueueOptions, MessagePriority, OfflineMessageQueue, OfflineQueueEntry, QueueError, QueueStatus};
use crate::session::SessionManager;
use crate::util::now_ms;
use crate::verification::{TrustState, VerificationError, VerificationManager};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events from the messaging system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingEvent {
    /// New message received
    MessageReceived { from_peer_id: String, message: Message },
    /// Message handed to the transport
    MessageSent { to_peer_id: String, message_id: String },
    /// Delivery receipt received
    DeliveryReceipt { peer_id: String, message_id: String },
    /// Session accepted from a peer's handshake
    SessionEstablished { peer_id: String },
    /// Message gave up on its retries or expired
    DeliveryFailed {
        peer_id: String,
        message_id: String,
        status: QueueStatus,
    },
    /// Tampering, replay or a changed identity key
    SecurityAlert { peer_id: String, reason: String },
}

/// Outcome of one flush pass for a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
}

/// Messaging service
pub struct MessagingService {
    /// Our peer ID
    peer_id: String,
    sessions: Arc<SessionManager>,
    handler: MessageHandler,
    queue: Arc<OfflineMessageQueue>,
    transport: Arc<dyn Transport>,
    verification: Option<Arc<VerificationManager>>,
    config: CoreConfig,
    connected: DashSet<String>,
    /// One flush at a time per peer
    flush_locks: DashMap<String, Arc<Mutex<()>>>,
    events: mpsc::Sender<MessagingEvent>,
}

impl MessagingService {
    /// Create the service and the channel its events arrive on
    pub fn new(
        local_peer_id: &str,
        sessions: Arc<SessionManager>,
        queue: Arc<OfflineMessageQueue>,
        transport: Arc<dyn Transport>,
        config: CoreConfig,
    ) -> (Self, mpsc::Receiver<MessagingEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let service = Self {
            peer_id: local_peer_id.to_string(),
            handler: MessageHandler::new(local_peer_id, sessions.clone()),
            sessions,
            queue,
            transport,
            verification: None,
            config,
            connected: DashSet::new(),
            flush_locks: DashMap::new(),
            events: event_tx,
        };
        (service, event_rx)
    }

    /// Track peer identity keys and raise an alert when one changes
    pub fn with_verification(mut self, verification: Arc<VerificationManager>) -> Self {
        self.verification = Some(verification);
        self
    }

    /// Get our peer ID
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connected.contains(peer_id)
    }

    /// Start a session from a peer's published bundle.
    ///
    /// The bundle's identity key is checked against the one on record
    /// before any message is queued for the peer.
    pub async fn initiate_session(&self, peer_id: &str, bundle: &PreKeyBundle) -> Result<(), MessagingError> {
        self.sessions
            .initiate_session(peer_id, bundle)
            .await
            .map_err(HandlerError::from)?;
        self.check_identity(peer_id, &bundle.identity_key).await
    }

    /// Queue a message and deliver it right away if the peer is reachable.
    ///
    /// Returns the message ID that receipts will refer to.
    pub async fn send_message(
        &self,
        peer_id: &str,
        message_type: MessageType,
        body: &str,
        priority: MessagePriority,
        require_ack: bool,
    ) -> Result<String, MessagingError> {
        // Require encryption - no unencrypted fallback
        if !self.sessions.has_session(peer_id) {
            return Err(MessagingError::NoSession(peer_id.to_string()));
        }

        let message = Message::new(message_type, body, require_ack);
        let options = EnqueueOptions {
            priority,
            require_ack,
            ..EnqueueOptions::default()
        };
        self.queue
            .enqueue(peer_id, message_type.as_str(), message.to_bytes(), options)
            .await?;

        if self.is_connected(peer_id) {
            self.flush_peer(peer_id).await?;
        }
        Ok(message.id)
    }

    /// Send a text message to a peer
    pub async fn send_text(&self, peer_id: &str, text: &str) -> Result<String, MessagingError> {
        self.send_message(peer_id, MessageType::Text, text, MessagePriority::Normal, true).await
    }

    /// Attempt every due entry for the peer in delivery order.
    ///
    /// Each outcome is persisted before the next attempt, so dropping the
    /// returned future loses nothing.
    pub async fn flush_peer(&self, peer_id: &str) -> Result<FlushReport, MessagingError> {
        let lock = self.flush_lock(peer_id);
        let _guard = lock.lock().await;

        let mut report = FlushReport::default();
        for entry in self.queue.due_messages_at(peer_id, now_ms()).await {
            report.attempted += 1;
            match self.deliver(&entry).await {
                Ok(message_id) => {
                    self.queue.mark_as_sent(&entry.id).await?;
                    report.sent += 1;
                    self.emit(MessagingEvent::MessageSent {
                        to_peer_id: peer_id.to_string(),
                        message_id,
                    })
                    .await;
                }
                Err(e) => {
                    let retryable = !matches!(e, MessagingError::Protocol(_));
                    let status = self.queue.mark_as_failed(&entry.id, retryable).await?;
                    warn!("Delivery of {} to {} failed: {}", entry.id, peer_id, e);
                    match status {
                        QueueStatus::Retrying => report.retrying += 1,
                        _ => {
                            report.failed += 1;
                            self.emit(MessagingEvent::DeliveryFailed {
                                peer_id: peer_id.to_string(),
                                message_id: message_id_of(&entry),
                                status,
                            })
                            .await;
                        }
                    }
                    // Peer went away; the rest waits for the next connect or tick
                    if matches!(e, MessagingError::Transport(_)) {
                        break;
                    }
                }
            }
        }

        if report.attempted > 0 {
            debug!("Flushed {}: {:?}", peer_id, report);
        }
        Ok(report)
    }

    /// React to one transport event
    pub async fn handle_event(&self, event: TransportEvent) -> Result<(), MessagingError> {
        match event {
            TransportEvent::PeerConnected { peer_id } => {
                info!("Peer connected: {}", peer_id);
                self.connected.insert(peer_id.clone());
                self.flush_peer(&peer_id).await?;
            }
            TransportEvent::PeerDisconnected { peer_id } => {
                info!("Peer disconnected: {}", peer_id);
                self.connected.remove(&peer_id);
            }
            TransportEvent::MessageReceived { peer_id, data } => {
                self.handle_incoming(&peer_id, &data).await?;
            }
        }
        Ok(())
    }

    /// Decrypt an inbound envelope and dispatch its contents
    pub async fn handle_incoming(&self, from_peer_id: &str, data: &[u8]) -> Result<(), MessagingError> {
        let envelope = Envelope::from_bytes(data)?;
        debug!(
            "handle_incoming: envelope from {} (immediate: {})",
            envelope.sender_peer_id, from_peer_id
        );

        let incoming = match self.handler.process_incoming(&envelope).await {
            Ok(incoming) => incoming,
            Err(e) => {
                if e.is_security_event() {
                    self.emit(MessagingEvent::SecurityAlert {
                        peer_id: envelope.sender_peer_id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                }
                return Err(e.into());
            }
        };

        if incoming.session_established {
            self.on_session_established(&incoming).await?;
        }

        let Incoming {
            sender_peer_id,
            message,
            ..
        } = incoming;
        match message.message_type {
            MessageType::Receipt => {
                self.emit(MessagingEvent::DeliveryReceipt {
                    peer_id: sender_peer_id,
                    message_id: message.body,
                })
                .await;
            }
            MessageType::Text | MessageType::Typing | MessageType::Control => {
                let ack = message.require_ack.then(|| message.id.clone());
                self.emit(MessagingEvent::MessageReceived {
                    from_peer_id: sender_peer_id.clone(),
                    message,
                })
                .await;
                if let Some(message_id) = ack {
                    self.send_receipt(&sender_peer_id, &message_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Drive the service until `shutdown` flips or the event stream ends
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut retry = tokio::time::interval(Duration::from_millis(self.config.queue.retry_tick_ms));
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(Duration::from_millis(self.config.queue.cleanup_interval_ms));
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Messaging service {} running", self.peer_id);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if let Err(e) = self.handle_event(event).await {
                        warn!("Failed to handle transport event: {}", e);
                    }
                }
                _ = retry.tick() => {
                    self.retry_connected().await;
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.queue.cleanup_expired_messages().await {
                        error!("Expiry sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Messaging service {} stopped", self.peer_id);
    }

    async fn retry_connected(&self) {
        let peers: Vec<String> = self.connected.iter().map(|p| p.key().clone()).collect();
        for peer_id in peers {
            if let Err(e) = self.flush_peer(&peer_id).await {
                error!("Retry pass for {} failed: {}", peer_id, e);
            }
        }
    }

    async fn deliver(&self, entry: &OfflineQueueEntry) -> Result<String, MessagingError> {
        let message = Message::from_bytes(&entry.payload)?;
        let envelope = self.handler.prepare_outgoing(&entry.peer_id, &message).await?;
        self.transport.send(&entry.peer_id, envelope.to_bytes()).await?;
        Ok(message.id)
    }

    async fn send_receipt(&self, peer_id: &str, message_id: &str) -> Result<(), MessagingError> {
        self.send_message(peer_id, MessageType::Receipt, message_id, MessagePriority::High, false)
            .await
            .map(|_| ())
    }

    async fn on_session_established(&self, incoming: &Incoming) -> Result<(), MessagingError> {
        let peer_id = &incoming.sender_peer_id;
        info!("Session established with {}", peer_id);
        self.emit(MessagingEvent::SessionEstablished {
            peer_id: peer_id.clone(),
        })
        .await;

        match self.sessions.get_session_info(peer_id).and_then(|s| s.remote_identity_key) {
            Some(identity_key) => self.check_identity(peer_id, &identity_key).await,
            None => Ok(()),
        }
    }

    /// Pin the peer's identity on first sight, alert when it differs later
    async fn check_identity(&self, peer_id: &str, identity_key: &[u8; 32]) -> Result<(), MessagingError> {
        let Some(verification) = &self.verification else {
            return Ok(());
        };
        if verification.record_identity(peer_id, identity_key).await? == TrustState::Changed {
            self.emit(MessagingEvent::SecurityAlert {
                peer_id: peer_id.to_string(),
                reason: "identity key changed".to_string(),
            })
            .await;
        }
        Ok(())
    }

    fn flush_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        self.flush_locks.entry(peer_id.to_string()).or_default().clone()
    }

    async fn emit(&self, event: MessagingEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Messaging event dropped, no listener");
        }
    }
}

fn message_id_of(entry: &OfflineQueueEntry) -> String {
    Message::from_bytes(&entry.payload)
        .map(|m| m.id)
        .unwrap_or_else(|_| entry.id.clone())
}

/// Messaging errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("No session with peer {0}")]
    NoSession(String),
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),
}
