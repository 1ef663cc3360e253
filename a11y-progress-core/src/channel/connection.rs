//! Reconnecting progress channel
//!
//! One [`ProgressChannel`] owns at most one live transport and at most one
//! pending reconnect timer. Every `open`/`close` bumps a generation counter;
//! sessions and timers carry the generation they were started under and
//! become no-ops once it is stale.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ChannelConfig;
use crate::events::{decode_server_message, ClientMessage, EventKind};

use super::status::{ChannelError, ChannelEvent, ConnectionState, ConnectionStatus};
use super::transport::{Connector, Frame, Transport, NORMAL_CLOSE};

/// Used when the liveness check is disabled; the branch is never polled then.
const IDLE_PLACEHOLDER: Duration = Duration::from_secs(3600);

/// Client side of a job's progress stream
pub struct ProgressChannel {
    shared: Arc<Shared>,
}

struct Shared {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    /// Called with the state lock held, so events leave in lock order
    sink: Box<dyn Fn(ChannelEvent) + Send + Sync>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    generation: u64,
    status: ConnectionStatus,
    /// Queue into the live session; Some only while connected
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

/// How a session ended
enum SessionEnd {
    /// `close()` dropped the outbound queue
    Detached,
    /// Server closed with the normal close code
    Normal,
    Abnormal(ChannelError),
}

impl ProgressChannel {
    /// Create a disconnected channel. Decoded messages and status changes are
    /// delivered on `events`.
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self::with_sink(config, connector, move |event| {
            let _ = events.send(event);
        })
    }

    /// Create a disconnected channel that hands every event to `sink`.
    ///
    /// Events from a session are handed over before `open`/`close` can
    /// invalidate that session, and never after.
    pub fn with_sink(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        sink: impl Fn(ChannelEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                sink: Box::new(sink),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Connect to `address`.
    ///
    /// No-op while the same address is connecting, connected or waiting on a
    /// reconnect. A different address tears the current connection down first.
    /// Must be called from within a Tokio runtime.
    pub fn open(&self, address: &str) {
        let mut inner = self.shared.lock();

        let same_address = inner.status.address.as_deref() == Some(address);
        if same_address
            && (inner.status.state != ConnectionState::Disconnected
                || inner.reconnect_timer.is_some())
        {
            tracing::debug!(address, state = inner.status.state.as_str(), "Open ignored, already active");
            return;
        }

        if inner.status.address.is_some() && !same_address {
            tracing::info!(
                from = ?inner.status.address,
                to = address,
                "Switching progress channel to a new address"
            );
            Shared::teardown(&mut inner);
        }

        inner.generation += 1;
        inner.status = ConnectionStatus {
            address: Some(address.to_string()),
            ..Default::default()
        };
        self.shared.start_connect(&mut inner);
    }

    /// Disconnect and cancel any pending reconnect. Safe to call repeatedly.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        let was_idle = inner.status.state == ConnectionState::Disconnected
            && inner.reconnect_timer.is_none();
        Shared::teardown(&mut inner);
        if !was_idle {
            tracing::info!(address = ?inner.status.address, "Progress channel closed");
            self.shared.emit_status(&inner);
        }
    }

    /// Queue a message for the server. Returns false when not connected.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let inner = self.shared.lock();
        if inner.status.state != ConnectionState::Connected {
            return false;
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return false;
        };
        match message.to_json() {
            Ok(text) => outbound.send(text).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode outbound message");
                false
            }
        }
    }

    /// Best-effort subscription request; false when not connected
    pub fn subscribe(&self, events: Vec<EventKind>) -> bool {
        self.send(&ClientMessage::Subscribe { events })
    }

    /// Best-effort unsubscription request; false when not connected
    pub fn unsubscribe(&self, events: Vec<EventKind>) -> bool {
        self.send(&ClientMessage::Unsubscribe { events })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().status.clone()
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        Shared::teardown(&mut inner);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_status(&self, inner: &Inner) {
        (self.sink)(ChannelEvent::Status(inner.status.clone()));
    }

    /// Invalidate the current generation and release its resources
    fn teardown(inner: &mut Inner) {
        inner.generation += 1;
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        let connected = inner.outbound.take().is_some();
        if let Some(session) = inner.session.take() {
            // A connected session sees its queue close and shuts down with a
            // normal close frame; a pending connect has nothing to close.
            if !connected {
                session.abort();
            }
        }
        inner.status.state = ConnectionState::Disconnected;
        inner.status.reconnect_pending = false;
    }

    fn start_connect(self: &Arc<Self>, inner: &mut Inner) {
        let Some(address) = inner.status.address.clone() else {
            return;
        };
        inner.status.state = ConnectionState::Connecting;
        let generation = inner.generation;
        let shared = Arc::clone(self);
        inner.session = Some(tokio::spawn(async move {
            shared.run_session(generation, address).await;
        }));
        self.emit_status(inner);
    }

    async fn run_session(self: Arc<Self>, generation: u64, address: String) {
        tracing::debug!(address = %address, generation, "Connecting progress channel");

        let mut transport = match self.connector.connect(&address).await {
            Ok(transport) => transport,
            Err(e) => {
                self.handle_abnormal(generation, ChannelError::Transport(e.to_string()));
                return;
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let superseded = {
            let mut inner = self.lock();
            if inner.generation != generation {
                true
            } else {
                self.mark_connected(&mut inner, outbound_tx);
                false
            }
        };
        if superseded {
            let _ = transport.close().await;
            return;
        }
        tracing::info!(address = %address, "Progress channel connected");

        let end = self
            .pump(generation, transport.as_mut(), &mut outbound_rx)
            .await;

        match end {
            SessionEnd::Detached => {
                if let Err(e) = transport.close().await {
                    tracing::debug!(error = %e, "Close handshake failed");
                }
            }
            SessionEnd::Normal => self.handle_normal_close(generation),
            SessionEnd::Abnormal(error) => self.handle_abnormal(generation, error),
        }
    }

    fn mark_connected(&self, inner: &mut Inner, outbound: mpsc::UnboundedSender<String>) {
        inner.status.state = ConnectionState::Connected;
        inner.status.reconnect_attempts = 0;
        inner.status.reconnect_pending = false;
        inner.status.last_error = None;

        // Liveness probe goes out before anything else queued.
        if let Ok(ping) = ClientMessage::Ping.to_json() {
            let _ = outbound.send(ping);
        }
        inner.outbound = Some(outbound);
        self.emit_status(inner);
    }

    async fn pump(
        &self,
        generation: u64,
        transport: &mut dyn Transport,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> SessionEnd {
        let liveness = self.config.liveness_timeout();
        let idle = tokio::time::sleep(liveness.unwrap_or(IDLE_PLACEHOLDER));
        tokio::pin!(idle);

        loop {
            tokio::select! {
                queued = outbound.recv() => {
                    let Some(text) = queued else {
                        return SessionEnd::Detached;
                    };
                    if let Err(e) = transport.send_text(text).await {
                        return SessionEnd::Abnormal(ChannelError::Transport(e.to_string()));
                    }
                }
                frame = transport.next_frame() => {
                    if let Some(timeout) = liveness {
                        idle.as_mut().reset(Instant::now() + timeout);
                    }
                    match frame {
                        None => {
                            return SessionEnd::Abnormal(ChannelError::AbnormalClose {
                                code: None,
                                reason: "stream ended without a close frame".to_string(),
                            });
                        }
                        Some(Err(e)) => {
                            return SessionEnd::Abnormal(ChannelError::Transport(e.to_string()));
                        }
                        Some(Ok(Frame::Text(text))) => self.deliver(generation, &text),
                        Some(Ok(Frame::Close { code, reason })) => {
                            if code == Some(NORMAL_CLOSE) {
                                return SessionEnd::Normal;
                            }
                            return SessionEnd::Abnormal(ChannelError::AbnormalClose { code, reason });
                        }
                        Some(Ok(Frame::Other)) => {}
                    }
                }
                _ = &mut idle, if liveness.is_some() => {
                    let timeout = liveness.unwrap_or(IDLE_PLACEHOLDER);
                    tracing::warn!(?timeout, "Progress channel went quiet");
                    return SessionEnd::Abnormal(ChannelError::LivenessTimeout(timeout));
                }
            }
        }
    }

    fn deliver(&self, generation: u64, text: &str) {
        match decode_server_message(text) {
            Ok(message) => {
                let inner = self.lock();
                if inner.generation == generation {
                    (self.sink)(ChannelEvent::Message(message));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable progress frame");
                let mut inner = self.lock();
                if inner.generation == generation {
                    inner.status.decode_failures += 1;
                }
            }
        }
    }

    fn handle_normal_close(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        tracing::info!(address = ?inner.status.address, "Server closed progress channel");
        inner.outbound = None;
        inner.session = None;
        inner.status.state = ConnectionState::Disconnected;
        self.emit_status(&inner);
    }

    fn handle_abnormal(self: &Arc<Self>, generation: u64, error: ChannelError) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.outbound = None;
        inner.session = None;
        inner.status.state = ConnectionState::Disconnected;

        if inner.reconnect_timer.is_some() {
            tracing::debug!("Reconnect already pending");
            self.emit_status(&inner);
            return;
        }

        let attempts = inner.status.reconnect_attempts;
        if attempts >= self.config.max_reconnect_attempts {
            tracing::error!(
                attempts,
                last_error = %error,
                "Progress channel giving up"
            );
            inner.status.reconnect_pending = false;
            inner.status.last_error = Some(ChannelError::ReconnectExhausted { attempts });
            self.emit_status(&inner);
            return;
        }

        inner.status.reconnect_attempts = attempts + 1;
        inner.status.reconnect_pending = true;
        let delay = self.config.reconnect_delay();
        tracing::warn!(
            error = %error,
            attempt = attempts + 1,
            max = self.config.max_reconnect_attempts,
            ?delay,
            "Progress channel lost, scheduling reconnect"
        );
        inner.status.last_error = Some(error);

        let shared = Arc::clone(self);
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire_reconnect(generation);
        }));
        self.emit_status(&inner);
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.reconnect_timer = None;
        inner.status.reconnect_pending = false;
        self.start_connect(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::events::{ControlMessage, ServerMessage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Server side of one scripted connection
    struct ScriptedSession {
        to_client: mpsc::UnboundedSender<Frame>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl ScriptedSession {
        fn push_text(&self, text: &str) {
            self.to_client.send(Frame::Text(text.to_string())).unwrap();
        }

        fn close_with(&self, code: u16) {
            self.to_client
                .send(Frame::Close {
                    code: Some(code),
                    reason: String::new(),
                })
                .unwrap();
        }
    }

    struct ScriptedTransport {
        inbound: mpsc::UnboundedReceiver<Frame>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send_text(&mut self, text: String) -> Result<()> {
            self.outbound
                .send(text)
                .map_err(|_| Error::Channel("peer gone".to_string()))
        }

        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            let _ = self.outbound.send("<close>".to_string());
            Ok(())
        }
    }

    /// Accepts or refuses connections according to a script
    struct ScriptedConnector {
        connects: AtomicUsize,
        refusals: Mutex<VecDeque<bool>>,
        sessions: mpsc::UnboundedSender<ScriptedSession>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _address: &str) -> Result<Box<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let refuse = self
                .refusals
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(false);
            if refuse {
                return Err(Error::Channel("connection refused".to_string()));
            }
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            let _ = self.sessions.send(ScriptedSession {
                to_client,
                from_client,
            });
            Ok(Box::new(ScriptedTransport { inbound, outbound }))
        }
    }

    struct Harness {
        channel: ProgressChannel,
        connector: Arc<ScriptedConnector>,
        sessions: mpsc::UnboundedReceiver<ScriptedSession>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    }

    impl Harness {
        fn new(config: ChannelConfig, refusals: &[bool]) -> Self {
            let (sessions_tx, sessions) = mpsc::unbounded_channel();
            let connector = Arc::new(ScriptedConnector {
                connects: AtomicUsize::new(0),
                refusals: Mutex::new(refusals.iter().copied().collect()),
                sessions: sessions_tx,
            });
            let (events_tx, events) = mpsc::unbounded_channel();
            let channel = ProgressChannel::new(config, connector.clone(), events_tx);
            Self {
                channel,
                connector,
                sessions,
                events,
            }
        }

        fn connects(&self) -> usize {
            self.connector.connects.load(Ordering::SeqCst)
        }

        async fn next_session(&mut self) -> ScriptedSession {
            self.sessions.recv().await.expect("connector dropped")
        }

        /// Wait for a status update matching `pred`
        async fn wait_status(&mut self, pred: impl Fn(&ConnectionStatus) -> bool) -> ConnectionStatus {
            loop {
                match self.events.recv().await.expect("channel dropped") {
                    ChannelEvent::Status(status) if pred(&status) => return status,
                    _ => {}
                }
            }
        }

        async fn next_message(&mut self) -> ServerMessage {
            loop {
                if let ChannelEvent::Message(message) =
                    self.events.recv().await.expect("channel dropped")
                {
                    return message;
                }
            }
        }
    }

    fn config(max_attempts: u32) -> ChannelConfig {
        ChannelConfig {
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: max_attempts,
            liveness_timeout_secs: 0,
        }
    }

    const ADDR: &str = "ws://test/api/progress?upload_id=job-1";

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_ping_and_resets_attempts() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.open(ADDR);
        let mut session = h.next_session().await;

        let status = h.wait_status(ConnectionStatus::is_connected).await;
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.address.as_deref(), Some(ADDR));
        assert_eq!(session.from_client.recv().await.unwrap(), r#"{"type":"ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_is_idempotent() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.open(ADDR);
        h.channel.open(ADDR);
        let _session = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;
        h.channel.open(ADDR);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fails_when_not_connected() {
        let mut h = Harness::new(config(3), &[]);
        assert!(!h.channel.send(&ClientMessage::Ping));
        assert!(!h.channel.subscribe(vec![EventKind::AgentStart]));

        h.channel.open(ADDR);
        let mut session = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;
        assert!(h.channel.subscribe(vec![EventKind::AgentStart]));
        assert!(h.channel.unsubscribe(vec![EventKind::AgentProgress]));

        assert_eq!(session.from_client.recv().await.unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(
            session.from_client.recv().await.unwrap(),
            r#"{"type":"subscribe","events":["agent_start"]}"#
        );
        assert_eq!(
            session.from_client.recv().await.unwrap(),
            r#"{"type":"unsubscribe","events":["agent_progress"]}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_failure_keeps_connection_open() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.open(ADDR);
        let session = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;

        session.push_text("{not json");
        session.push_text(r#"{"type":"keepalive"}"#);

        assert_eq!(
            h.next_message().await,
            ServerMessage::Control(ControlMessage::Keepalive)
        );
        let status = h.channel.status();
        assert!(status.is_connected());
        assert_eq!(status.decode_failures, 1);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_schedules_one_reconnect_and_close_cancels_it() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.open(ADDR);
        let session = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;

        session.close_with(1006);
        let status = h.wait_status(|s| s.reconnect_pending).await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.reconnect_attempts, 1);

        h.channel.close();
        let status = h.channel.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.reconnect_pending);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connects(), 1);
        assert_eq!(h.channel.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_delay() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.open(ADDR);
        let first = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;

        drop(first);
        h.wait_status(|s| s.reconnect_pending).await;
        assert_eq!(h.connects(), 1);

        let _second = h.next_session().await;
        let status = h.wait_status(ConnectionStatus::is_connected).await;
        assert_eq!(h.connects(), 2);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_does_not_reconnect() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.open(ADDR);
        let session = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;

        session.close_with(NORMAL_CLOSE);
        let status = h
            .wait_status(|s| s.state == ConnectionState::Disconnected)
            .await;
        assert!(!status.reconnect_pending);
        assert!(status.last_error.is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        // Initial connect succeeds, then every reconnect is refused.
        let mut h = Harness::new(config(2), &[false, true, true, true]);
        h.channel.open(ADDR);
        let session = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;

        session.close_with(1011);
        let status = h.wait_status(ConnectionStatus::is_terminal).await;
        assert_eq!(
            status.last_error,
            Some(ChannelError::ReconnectExhausted { attempts: 2 })
        );
        assert!(!status.reconnect_pending);
        assert_eq!(h.connects(), 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.connects(), 3);
        assert!(h.channel.status().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_open_retries_after_terminal_state() {
        let mut h = Harness::new(config(0), &[true]);
        h.channel.open(ADDR);
        h.wait_status(ConnectionStatus::is_terminal).await;

        h.channel.open(ADDR);
        let _session = h.next_session().await;
        let status = h.wait_status(ConnectionStatus::is_connected).await;
        assert_eq!(h.connects(), 2);
        assert!(status.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_new_address_replaces_connection() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.open(ADDR);
        let mut first = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;

        h.channel.open("ws://test/api/progress?upload_id=job-2");
        let second = h.next_session().await;
        let status = h.wait_status(ConnectionStatus::is_connected).await;
        assert!(status.address.as_deref().unwrap().ends_with("job-2"));

        // The old session shuts down cleanly and its frames are ignored.
        assert_eq!(first.from_client.recv().await.unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(first.from_client.recv().await.unwrap(), "<close>");
        let _ = first.to_client.send(Frame::Text(r#"{"type":"pong"}"#.to_string()));

        second.push_text(r#"{"type":"keepalive"}"#);
        assert_eq!(
            h.next_message().await,
            ServerMessage::Control(ControlMessage::Keepalive)
        );
        assert_eq!(h.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_timeout_triggers_reconnect() {
        let mut h = Harness::new(
            ChannelConfig {
                liveness_timeout_secs: 5,
                ..config(3)
            },
            &[],
        );
        h.channel.open(ADDR);
        let _session = h.next_session().await;
        h.wait_status(ConnectionStatus::is_connected).await;

        let status = h.wait_status(|s| s.reconnect_pending).await;
        assert_eq!(
            status.last_error,
            Some(ChannelError::LivenessTimeout(Duration::from_secs(5)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let mut h = Harness::new(config(3), &[]);
        h.channel.close();
        h.channel.close();
        assert_eq!(h.channel.status().state, ConnectionState::Disconnected);
        assert!(h.events.try_recv().is_err());
    }
}
