//! Wire contract for the progress stream
//!
//! The backend pushes JSON text frames over the progress WebSocket. Two
//! families of frames arrive on the same socket:
//!
//! ```text
//! {"type": "progress_update", "event_type": "agent_start", "agent_name": "contrast", ...}
//! {"type": "keepalive", "timestamp": "..."}
//! ```
//!
//! Anything carrying an `event_type` is a [`ProgressEvent`] and is folded by
//! the reducer. Everything else is a [`ControlMessage`] and only affects
//! connection bookkeeping. Unknown fields on progress events are kept in
//! [`ProgressEvent::extra`] so nothing the server sends is lost.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Kind of a progress event.
///
/// Names the server does not (yet) emit decode to [`EventKind::Unknown`] and
/// encode back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    AnalysisStart,
    AnalysisComplete,
    AgentStart,
    AgentProgress,
    AgentComplete,
    AgentError,
    ClusteringStart,
    ClusteringComplete,
    PatchGenerationStart,
    PatchGenerationComplete,
    Unknown(String),
}

impl EventKind {
    /// Every kind the backend currently emits
    pub const KNOWN: [EventKind; 10] = [
        EventKind::AnalysisStart,
        EventKind::AnalysisComplete,
        EventKind::AgentStart,
        EventKind::AgentProgress,
        EventKind::AgentComplete,
        EventKind::AgentError,
        EventKind::ClusteringStart,
        EventKind::ClusteringComplete,
        EventKind::PatchGenerationStart,
        EventKind::PatchGenerationComplete,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::AnalysisStart => "analysis_start",
            EventKind::AnalysisComplete => "analysis_complete",
            EventKind::AgentStart => "agent_start",
            EventKind::AgentProgress => "agent_progress",
            EventKind::AgentComplete => "agent_complete",
            EventKind::AgentError => "agent_error",
            EventKind::ClusteringStart => "clustering_start",
            EventKind::ClusteringComplete => "clustering_complete",
            EventKind::PatchGenerationStart => "patch_generation_start",
            EventKind::PatchGenerationComplete => "patch_generation_complete",
            EventKind::Unknown(name) => name,
        }
    }

    /// Whether events of this kind describe a single agent's lifecycle
    pub fn is_agent_scoped(&self) -> bool {
        matches!(
            self,
            EventKind::AgentStart
                | EventKind::AgentProgress
                | EventKind::AgentComplete
                | EventKind::AgentError
        )
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "analysis_start" => EventKind::AnalysisStart,
            "analysis_complete" => EventKind::AnalysisComplete,
            "agent_start" => EventKind::AgentStart,
            "agent_progress" => EventKind::AgentProgress,
            "agent_complete" => EventKind::AgentComplete,
            "agent_error" => EventKind::AgentError,
            "clustering_start" => EventKind::ClusteringStart,
            "clustering_complete" => EventKind::ClusteringComplete,
            "patch_generation_start" => EventKind::PatchGenerationStart,
            "patch_generation_complete" => EventKind::PatchGenerationComplete,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match EventKind::from(value.as_str()) {
            EventKind::Unknown(_) => EventKind::Unknown(value),
            known => known,
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server-emitted notification about job progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "event_type")]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    /// Fraction complete, 0.0 to 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Server timestamp exactly as sent (see [`ProgressEvent::emitted_at`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// Every other field, preserved opaquely
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProgressEvent {
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            kind: kind.into(),
            agent_name: None,
            progress: None,
            message: None,
            timestamp: None,
            upload_id: None,
            metadata: None,
            extra: Map::new(),
        }
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts.to_rfc3339());
        self
    }

    /// Salvage an event whose fields do not match the wire types.
    ///
    /// The kind becomes [`EventKind::Unknown`] carrying the raw `event_type`,
    /// so the reducer records it without touching agent state. Fields with
    /// the right type are kept; the rest stay in `extra` untouched.
    pub fn from_malformed(mut fields: Map<String, Value>) -> Self {
        let raw_kind = match fields.remove("event_type") {
            Some(Value::String(kind)) => kind,
            Some(other) => other.to_string(),
            None => String::new(),
        };

        let mut take_string = |key: &str| {
            if !matches!(fields.get(key), Some(Value::String(_))) {
                return None;
            }
            match fields.remove(key) {
                Some(Value::String(value)) => Some(value),
                _ => None,
            }
        };
        let agent_name = take_string("agent_name");
        let message = take_string("message");
        let timestamp = take_string("timestamp");
        let upload_id = take_string("upload_id");

        let progress = match fields.get("progress").and_then(Value::as_f64) {
            Some(progress) => {
                fields.remove("progress");
                Some(progress)
            }
            None => None,
        };
        let metadata = fields.remove("metadata").filter(|value| !value.is_null());

        Self {
            kind: EventKind::Unknown(raw_kind),
            agent_name,
            progress,
            message,
            timestamp,
            upload_id,
            metadata,
            extra: fields,
        }
    }

    /// Agent name, ignoring blank values
    pub fn agent(&self) -> Option<&str> {
        self.agent_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Parsed server timestamp.
    ///
    /// Accepts RFC 3339 and the offset-less ISO-8601 form the backend emits
    /// (interpreted as UTC). Returns None when absent or unparseable.
    pub fn emitted_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Connection bookkeeping frames that never reach the reducer
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    ConnectionEstablished { upload_id: Option<String> },
    Pong,
    Keepalive,
    SubscriptionConfirmed { events: Vec<EventKind> },
    UnsubscriptionConfirmed,
    Broadcast(Map<String, Value>),
    /// A JSON object without `event_type` and without a recognized `type`
    Other(Map<String, Value>),
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Progress(ProgressEvent),
    Control(ControlMessage),
}

/// Decode one inbound text frame.
///
/// Fails only when the text is not a JSON object. A progress event with
/// wrongly typed fields is kept as an unrecognized kind (see
/// [`ProgressEvent::from_malformed`]).
pub fn decode_server_message(text: &str) -> Result<ServerMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::Decode(format!("invalid JSON: {}", e)))?;

    let Value::Object(mut fields) = value else {
        return Err(Error::Decode("expected a JSON object".to_string()));
    };

    if fields.contains_key("event_type") {
        let event = match serde_json::from_value::<ProgressEvent>(Value::Object(fields.clone())) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Keeping malformed progress event as unrecognized");
                ProgressEvent::from_malformed(fields)
            }
        };
        return Ok(ServerMessage::Progress(event));
    }

    let kind = fields
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let control = match kind.as_str() {
        "connection_established" => ControlMessage::ConnectionEstablished {
            upload_id: fields
                .get("upload_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "pong" => ControlMessage::Pong,
        "keepalive" => ControlMessage::Keepalive,
        "subscription_confirmed" => ControlMessage::SubscriptionConfirmed {
            events: fields
                .remove("events")
                .and_then(|events| serde_json::from_value::<Vec<EventKind>>(events).ok())
                .unwrap_or_default(),
        },
        "unsubscription_confirmed" => ControlMessage::UnsubscriptionConfirmed,
        "broadcast" => ControlMessage::Broadcast(fields),
        _ => ControlMessage::Other(fields),
    };

    Ok(ServerMessage::Control(control))
}

/// Client-to-server messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe { events: Vec<EventKind> },
    Unsubscribe { events: Vec<EventKind> },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
