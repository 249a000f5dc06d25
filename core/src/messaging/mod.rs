//! Messaging module for peer-to-peer encrypted communications
//!
//! Combines a transport with sessions and the offline queue to enable
//! secure messaging.

mod handler;
pub mod manager;
mod protocol;
mod transport;

pub use handler::{HandlerError, Incoming, MessageHandler};
pub use manager::{FlushReport, MessagingError, MessagingEvent, MessagingService};
pub use protocol::{Envelope, EnvelopeKind, Message, MessageType, ProtocolError, PROTOCOL_VERSION};
pub use transport::{Transport, TransportError, TransportEvent};
