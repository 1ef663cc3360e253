//! Progress snapshot and the per-event fold

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::{ConnectionState, ConnectionStatus};
use crate::config::ProgressConfig;
use crate::events::{EventKind, ProgressEvent};

use super::bounded::BoundedList;

/// Capacities of the snapshot's bounded lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressLimits {
    pub recent_updates: usize,
    pub completed: usize,
    pub errored: usize,
}

impl Default for ProgressLimits {
    fn default() -> Self {
        Self {
            recent_updates: 20,
            completed: 10,
            errored: 5,
        }
    }
}

impl From<&ProgressConfig> for ProgressLimits {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            recent_updates: config.recent_updates,
            completed: config.completed,
            errored: config.errored,
        }
    }
}

/// A finished (or failed) agent as recorded in the snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentOutcome {
    pub agent_name: String,
    pub message: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

impl AgentOutcome {
    fn from_event(agent_name: &str, event: &ProgressEvent) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            message: event.message.clone(),
            at: event.emitted_at(),
        }
    }
}

/// The reduced, UI-facing view of a job's progress.
///
/// Snapshots are values: [`ProgressSnapshot::apply`] and [`reduce`] return a
/// new snapshot and never touch shared state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub connected: bool,
    pub reconnecting: bool,
    pub error: Option<String>,
    pub analyzing: bool,
    /// Currently running agents, in start order, each name at most once
    pub active_agents: Vec<String>,
    pub completed_agents: BoundedList<AgentOutcome>,
    pub errored_agents: BoundedList<AgentOutcome>,
    /// Every event in arrival order
    pub recent_updates: BoundedList<ProgressEvent>,
    pub events_seen: u64,
    /// Updates recorded since the history was last cleared
    pub updates_since_clear: u64,
    /// Completions recorded since the history was last cleared
    pub completions_since_clear: u64,
    #[serde(skip)]
    limits: ProgressLimits,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::new(ProgressLimits::default())
    }
}

impl ProgressSnapshot {
    pub fn new(limits: ProgressLimits) -> Self {
        Self {
            connected: false,
            reconnecting: false,
            error: None,
            analyzing: false,
            active_agents: Vec::new(),
            completed_agents: BoundedList::new(limits.completed),
            errored_agents: BoundedList::new(limits.errored),
            recent_updates: BoundedList::new(limits.recent_updates),
            events_seen: 0,
            updates_since_clear: 0,
            completions_since_clear: 0,
            limits,
        }
    }

    pub fn limits(&self) -> ProgressLimits {
        self.limits
    }

    pub fn is_active(&self, agent_name: &str) -> bool {
        self.active_agents.iter().any(|name| name == agent_name)
    }

    pub fn has_completed(&self, agent_name: &str) -> bool {
        self.completed_agents
            .iter()
            .any(|outcome| outcome.agent_name == agent_name)
    }

    pub fn has_errored(&self, agent_name: &str) -> bool {
        self.errored_agents
            .iter()
            .any(|outcome| outcome.agent_name == agent_name)
    }

    /// Fold one event into this snapshot
    pub fn apply(mut self, event: &ProgressEvent) -> Self {
        self.events_seen += 1;
        self.updates_since_clear += 1;
        self.recent_updates.push(event.clone());

        match (&event.kind, event.agent()) {
            (EventKind::AnalysisStart, _) => {
                self.analyzing = true;
                self.active_agents.clear();
                self.completed_agents.clear();
                self.errored_agents.clear();
            }
            (EventKind::AnalysisComplete, _) => {
                self.analyzing = false;
            }
            (EventKind::AgentStart, Some(agent)) => {
                if !self.is_active(agent) {
                    self.active_agents.push(agent.to_string());
                }
            }
            (EventKind::AgentComplete, Some(agent)) => {
                self.active_agents.retain(|name| name != agent);
                self.completed_agents
                    .push(AgentOutcome::from_event(agent, event));
                self.completions_since_clear += 1;
            }
            (EventKind::AgentError, Some(agent)) => {
                self.active_agents.retain(|name| name != agent);
                self.errored_agents
                    .push(AgentOutcome::from_event(agent, event));
            }
            (kind, None) if kind.is_agent_scoped() => {
                tracing::debug!(event_type = %kind, "Agent event without agent_name recorded as update only");
            }
            _ => {}
        }

        self
    }

    /// Copy connectivity fields from the channel status
    pub fn with_connection(mut self, status: &ConnectionStatus) -> Self {
        self.connected = status.state == ConnectionState::Connected;
        self.reconnecting = status.reconnect_pending
            || (status.state == ConnectionState::Connecting && status.reconnect_attempts > 0);
        self.error = status.last_error.as_ref().map(ToString::to_string);
        self
    }

    /// Empty snapshot with the same limits and connectivity
    pub fn cleared(&self) -> Self {
        Self {
            connected: self.connected,
            reconnecting: self.reconnecting,
            error: self.error.clone(),
            ..Self::new(self.limits)
        }
    }

    /// Drop accumulated history while keeping the live job state
    pub fn cleared_history(mut self) -> Self {
        self.recent_updates.clear();
        self.completed_agents.clear();
        self.errored_agents.clear();
        self.updates_since_clear = 0;
        self.completions_since_clear = 0;
        self
    }
}

/// Fold `event` into `snapshot`, returning the new snapshot
pub fn reduce(snapshot: &ProgressSnapshot, event: &ProgressEvent) -> ProgressSnapshot {
    snapshot.clone().apply(event)
}
