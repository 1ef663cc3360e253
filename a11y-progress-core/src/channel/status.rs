//! Connection state reported by the progress channel

use std::time::Duration;

use thiserror::Error;

use crate::events::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Advisory errors surfaced through [`ConnectionStatus::last_error`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed unexpectedly (code {code:?}): {reason}")]
    AbnormalClose { code: Option<u16>, reason: String },

    #[error("no message from server for {0:?}")]
    LivenessTimeout(Duration),

    /// Terminal: only an explicit `open` retries after this
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub address: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub last_error: Option<ChannelError>,
    /// Inbound frames that could not be decoded on this connection
    pub decode_failures: u64,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Disconnected after exhausting reconnect attempts
    pub fn is_terminal(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && matches!(
                self.last_error,
                Some(ChannelError::ReconnectExhausted { .. })
            )
    }
}

/// What the channel hands its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ConnectionStatus),
    Message(ServerMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status() {
        let mut status = ConnectionStatus {
            last_error: Some(ChannelError::ReconnectExhausted { attempts: 5 }),
            ..Default::default()
        };
        assert!(status.is_terminal());

        status.state = ConnectionState::Connecting;
        assert!(!status.is_terminal());

        let status = ConnectionStatus {
            last_error: Some(ChannelError::Transport("refused".to_string())),
            ..Default::default()
        };
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ChannelError::ReconnectExhausted { attempts: 3 }.to_string(),
            "gave up after 3 reconnect attempts"
        );
        assert!(ChannelError::AbnormalClose {
            code: Some(1011),
            reason: "server error".to_string()
        }
        .to_string()
        .contains("1011"));
    }
}
