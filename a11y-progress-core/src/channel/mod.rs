//! Progress event channel
//!
//! Maintains a live WebSocket to the backend's progress endpoint for one
//! job, decodes frames into [`ServerMessage`](crate::events::ServerMessage)s
//! and recovers from transient disconnects.
//!
//! ## Lifecycle
//!
//! ```text
//! disconnected ──open──▶ connecting ──ok──▶ connected
//!      ▲                     │                  │
//!      │                  failure          abnormal close
//!      │                     ▼                  ▼
//!      └──── close ──── disconnected + reconnect timer (fixed delay)
//! ```
//!
//! After `max_reconnect_attempts` failed reconnects the channel stays
//! disconnected with [`ChannelError::ReconnectExhausted`] until the caller
//! opens it again.

mod connection;
mod status;
mod transport;

pub use connection::ProgressChannel;
pub use status::{ChannelError, ChannelEvent, ConnectionState, ConnectionStatus};
pub use transport::{Connector, Frame, Transport, WsConnector, NORMAL_CLOSE};
