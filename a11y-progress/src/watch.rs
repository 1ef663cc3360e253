//! Live progress view for a single upload

use std::time::Duration;

use a11y_progress_core::format::{
    connection_label, format_progress, format_relative_time_opt, snapshot_summary,
};
use a11y_progress_core::{Config, ProgressEvent, ProgressMonitor, ProgressSnapshot};
use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};

pub async fn run(config: &Config, upload_id: &str, exit_on_complete: bool) -> Result<()> {
    let monitor = ProgressMonitor::with_websocket(config);
    let mut snapshots = monitor.subscribe();
    monitor.open(upload_id);
    tracing::info!(upload_id, "a11y-progress watch starting");

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{prefix}] {msg}")?);
    pb.set_prefix("connecting");
    pb.enable_steady_tick(Duration::from_millis(120));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut printed = 0u64;
    let mut saw_analysis = false;

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snapshot = snapshots.borrow_and_update().clone();

                let unseen = unseen_events(&snapshot, &mut printed);
                if unseen.skipped > 0 {
                    pb.println(format!("... {} events not shown", unseen.skipped));
                }
                for event in unseen.events {
                    pb.println(event_line(event));
                }

                let status = monitor.status();
                pb.set_prefix(connection_label(&status));
                pb.set_message(snapshot_summary(&snapshot));

                if status.is_terminal() {
                    let reason = snapshot.error.clone().unwrap_or_else(|| "connection lost".to_string());
                    break Err(anyhow!(reason));
                }

                saw_analysis |= snapshot.analyzing;
                if exit_on_complete && saw_analysis && !snapshot.analyzing {
                    break Ok(());
                }
            }
        }
    };

    monitor.close();
    pb.finish_and_clear();

    let snapshot = monitor.snapshot();
    println!("{}", snapshot_summary(&snapshot));
    for outcome in snapshot.errored_agents.iter() {
        println!(
            "  failed: {} ({}) {}",
            outcome.agent_name,
            format_relative_time_opt(outcome.at),
            outcome.message.as_deref().unwrap_or("")
        );
    }

    outcome
}

/// Events that arrived since the last check
struct Unseen<'a> {
    /// Oldest first
    events: Vec<&'a ProgressEvent>,
    /// Arrived but already evicted from the recent-updates window
    skipped: u64,
}

fn unseen_events<'a>(snapshot: &'a ProgressSnapshot, printed: &mut u64) -> Unseen<'a> {
    if snapshot.events_seen < *printed {
        // snapshot was reset
        *printed = 0;
    }
    let fresh = snapshot.events_seen - *printed;
    *printed = snapshot.events_seen;

    let recent = &snapshot.recent_updates;
    let shown = fresh.min(recent.len() as u64);
    Unseen {
        events: recent.iter().skip(recent.len() - shown as usize).collect(),
        skipped: fresh - shown,
    }
}

fn event_line(event: &ProgressEvent) -> String {
    let time = event
        .emitted_at()
        .map(|ts| ts.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());

    let mut line = format!("{} {:<18}", time, event.kind.as_str());
    if let Some(agent) = event.agent() {
        line.push(' ');
        line.push_str(agent);
    }
    if let Some(progress) = event.progress {
        line.push(' ');
        line.push_str(&format_progress(progress));
    }
    if let Some(message) = &event.message {
        line.push_str(" - ");
        line.push_str(message);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use a11y_progress_core::EventKind;

    #[test]
    fn test_unseen_events_tracks_position() {
        let mut printed = 0;
        let snap = ProgressSnapshot::default()
            .apply(&ProgressEvent::new(EventKind::AnalysisStart))
            .apply(&ProgressEvent::new(EventKind::AgentStart).with_agent("contrast"));
        assert_eq!(unseen_events(&snap, &mut printed).events.len(), 2);
        assert_eq!(unseen_events(&snap, &mut printed).events.len(), 0);

        let snap = snap.apply(&ProgressEvent::new(EventKind::AgentComplete).with_agent("contrast"));
        let fresh = unseen_events(&snap, &mut printed);
        assert_eq!(fresh.events.len(), 1);
        assert_eq!(fresh.events[0].kind, EventKind::AgentComplete);
        assert_eq!(fresh.skipped, 0);

        let cleared = snap.cleared();
        assert_eq!(unseen_events(&cleared, &mut printed).events.len(), 0);
        assert_eq!(printed, 0);
    }

    #[test]
    fn test_unseen_events_reports_evicted_overflow() {
        let mut printed = 0;
        let mut snap = ProgressSnapshot::default();
        let capacity = snap.limits().recent_updates;
        for i in 0..capacity + 7 {
            snap = snap.apply(
                &ProgressEvent::new(EventKind::AgentProgress)
                    .with_agent("layout")
                    .with_message(format!("step {i}")),
            );
        }

        let unseen = unseen_events(&snap, &mut printed);
        assert_eq!(unseen.skipped, 7);
        assert_eq!(unseen.events.len(), capacity);
        assert_eq!(unseen.events[0].message.as_deref(), Some("step 7"));
    }

    #[test]
    fn test_event_line() {
        let event = ProgressEvent::new(EventKind::AgentProgress)
            .with_agent("aria")
            .with_progress(0.25)
            .with_message("Checking landmarks");
        let line = event_line(&event);
        assert!(line.ends_with("aria 25% - Checking landmarks"));
        assert!(line.starts_with("--:--:-- agent_progress"));
    }
}
