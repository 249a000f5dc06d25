//! Seam between the messaging service and whatever moves bytes

use async_trait::async_trait;

/// Events a transport reports to the messaging service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    MessageReceived { peer_id: String, data: Vec<u8> },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),
    #[error("Transport closed")]
    Closed,
}

/// Outbound half of a transport
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer_id: &str, data: Vec<u8>) -> Result<(), TransportError>;
}
