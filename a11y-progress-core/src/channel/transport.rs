//! Transport seam between the channel and the network
//!
//! [`WsConnector`] speaks WebSocket through `tokio-tungstenite`. Tests plug in
//! scripted implementations of the same traits.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

/// Close code for a deliberate, orderly shutdown
pub const NORMAL_CLOSE: u16 = 1000;

/// One inbound unit from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: Option<u16>, reason: String },
    /// Ping/pong or other control traffic; counts as liveness only
    Other,
}

/// A live, message-oriented duplex connection
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound frame, or None once the stream has ended.
    ///
    /// Must be cancel safe: the channel races it against outbound traffic.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;

    /// Close with [`NORMAL_CLOSE`]
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports for an address
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>>;
}

/// WebSocket connector backed by `tokio-tungstenite`
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>> {
        let (stream, response) = connect_async(address)
            .await
            .map_err(|e| Error::Channel(format!("failed to connect to {}: {}", address, e)))?;
        tracing::debug!(address, status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| Error::Channel(format!("failed to send frame: {}", e)))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(Error::Channel(format!("read failed: {}", e)))),
        };

        let frame = match message {
            WsMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
            WsMessage::Binary(bytes) => Frame::Text(String::from_utf8_lossy(&bytes).into_owned()),
            WsMessage::Close(close) => Frame::Close {
                code: close.as_ref().map(|c| u16::from(c.code)),
                reason: close
                    .map(|c| c.reason.as_str().to_owned())
                    .unwrap_or_default(),
            },
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Frame::Other,
        };
        Some(Ok(frame))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client closed".into(),
            }))
            .await
            .map_err(|e| Error::Channel(format!("failed to close: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ws_connector_reports_refused_connection() {
        // Port 9 (discard) is closed on CI hosts; either way this must not panic.
        let result = WsConnector.connect("ws://127.0.0.1:9/api/progress?upload_id=x").await;
        match result {
            Err(Error::Channel(msg)) => assert!(msg.contains("failed to connect")),
            Err(other) => panic!("unexpected error kind: {other}"),
            Ok(_) => {}
        }
    }

    #[tokio::test]
    async fn test_ws_connector_rejects_invalid_address() {
        assert!(WsConnector.connect("not a url").await.is_err());
    }
}
