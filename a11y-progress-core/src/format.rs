//! Formatting helpers shared across front ends.

use chrono::{DateTime, Utc};

use crate::channel::{ConnectionState, ConnectionStatus};
use crate::progress::ProgressSnapshot;

/// Format a timestamp as relative time (e.g., "2m ago").
pub fn format_relative_time(ts: DateTime<Utc>) -> String {
    let now = Utc::now();
    let duration = now.signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else {
        ts.format("%b %d %H:%M").to_string()
    }
}

/// Format an optional timestamp as relative time, or "-" if missing.
pub fn format_relative_time_opt(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => format_relative_time(ts),
        None => "-".to_string(),
    }
}

/// Format a 0.0-1.0 fraction as a whole percentage, clamped.
pub fn format_progress(fraction: f64) -> String {
    if fraction.is_nan() {
        return "?%".to_string();
    }
    format!("{:.0}%", (fraction.clamp(0.0, 1.0) * 100.0))
}

/// One-word connection indicator: connected, reconnecting, failed, ...
pub fn connection_label(status: &ConnectionStatus) -> &'static str {
    if status.is_terminal() {
        "failed"
    } else if status.reconnect_pending
        || (status.state == ConnectionState::Connecting && status.reconnect_attempts > 0)
    {
        "reconnecting"
    } else {
        status.state.as_str()
    }
}

/// Single-line summary of a snapshot
pub fn snapshot_summary(snapshot: &ProgressSnapshot) -> String {
    let phase = if snapshot.analyzing {
        "analyzing"
    } else {
        "idle"
    };
    let active = if snapshot.active_agents.is_empty() {
        "-".to_string()
    } else {
        snapshot.active_agents.join(", ")
    };
    format!(
        "{} | active: {} | completed: {} | errored: {}",
        phase,
        active,
        snapshot.completed_agents.len(),
        snapshot.errored_agents.len()
    )
}
