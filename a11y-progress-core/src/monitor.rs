//! Progress monitor: channel + reducer + cleanup, wired together
//!
//! The monitor is the single consumer of a [`ProgressChannel`]. It folds each
//! decoded event into the current [`ProgressSnapshot`] and publishes the result
//! on a `watch` channel, so any number of readers can observe snapshots
//! without touching shared state.
//!
//! Resets travel through the same queue as channel events, so a reset lands
//! exactly between the events it discards and the events it keeps. A status
//! naming a different address than the previous one marks a job switch.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::{ChannelEvent, ConnectionStatus, Connector, ProgressChannel, WsConnector};
use crate::config::Config;
use crate::events::{ClientMessage, EventKind, ServerMessage};
use crate::progress::{reduce, CleanupPolicy, ProgressLimits, ProgressSnapshot};

/// Input to the reducer task
#[derive(Debug)]
enum ReducerInput {
    Channel(ChannelEvent),
    /// Drop everything folded so far, keeping connectivity
    Reset,
}

pub struct ProgressMonitor {
    config: Config,
    channel: ProgressChannel,
    snapshots: Arc<watch::Sender<ProgressSnapshot>>,
    inputs: mpsc::UnboundedSender<ReducerInput>,
    current_job: Mutex<Option<String>>,
    reducer: JoinHandle<()>,
    cleanup: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Build a monitor over an arbitrary connector. Spawns background tasks,
    /// so it must be called from within a Tokio runtime.
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> Self {
        let limits = ProgressLimits::from(&config.progress);
        let (snapshot_tx, _) = watch::channel(ProgressSnapshot::new(limits));
        let snapshots = Arc::new(snapshot_tx);

        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let events = inputs.clone();
        let channel = ProgressChannel::with_sink(config.channel.clone(), connector, move |event| {
            let _ = events.send(ReducerInput::Channel(event));
        });

        let reducer = tokio::spawn(run_reducer(inputs_rx, Arc::clone(&snapshots)));

        let policy = CleanupPolicy::from(&config.progress);
        let cleanup = policy
            .interval
            .map(|_| tokio::spawn(run_cleanup(policy, Arc::clone(&snapshots))));

        Self {
            config: config.clone(),
            channel,
            snapshots,
            inputs,
            current_job: Mutex::new(None),
            reducer,
            cleanup,
        }
    }

    /// Monitor speaking WebSocket to the configured server
    pub fn with_websocket(config: &Config) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    /// Start following `upload_id`.
    ///
    /// Switching jobs resets the snapshot once every event of the previous
    /// job has been folded, and before any event of the new one.
    pub fn open(&self, upload_id: &str) {
        *self
            .current_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(upload_id.to_string());
        tracing::info!(upload_id, "Following analysis progress");
        self.channel.open(&self.config.progress_url(upload_id));
    }

    pub fn close(&self) {
        self.channel.close();
    }

    /// Reset the snapshot, keeping connectivity fields.
    ///
    /// Events already received are discarded even if not yet folded.
    pub fn clear_progress(&self) {
        let _ = self.inputs.send(ReducerInput::Reset);
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.channel.status()
    }

    pub fn current_job(&self) -> Option<String> {
        self.current_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn channel(&self) -> &ProgressChannel {
        &self.channel
    }

    pub fn send(&self, message: &ClientMessage) -> bool {
        self.channel.send(message)
    }

    pub fn subscribe_events(&self, events: Vec<EventKind>) -> bool {
        self.channel.subscribe(events)
    }

    pub fn unsubscribe_events(&self, events: Vec<EventKind>) -> bool {
        self.channel.unsubscribe(events)
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.channel.close();
        self.reducer.abort();
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
    }
}

async fn run_reducer(
    mut inputs: mpsc::UnboundedReceiver<ReducerInput>,
    snapshots: Arc<watch::Sender<ProgressSnapshot>>,
) {
    let mut address: Option<String> = None;

    while let Some(input) = inputs.recv().await {
        match input {
            ReducerInput::Reset => {
                snapshots.send_modify(|snapshot| *snapshot = snapshot.cleared());
            }
            ReducerInput::Channel(ChannelEvent::Status(status)) => {
                let switched = address.is_some() && status.address != address;
                if switched {
                    tracing::debug!(from = ?address, to = ?status.address, "Job switched, resetting snapshot");
                }
                address.clone_from(&status.address);
                snapshots.send_modify(|snapshot| {
                    let base = if switched {
                        snapshot.cleared()
                    } else {
                        std::mem::take(snapshot)
                    };
                    *snapshot = base.with_connection(&status);
                });
            }
            ReducerInput::Channel(ChannelEvent::Message(ServerMessage::Progress(event))) => {
                tracing::debug!(
                    event_type = %event.kind,
                    agent = event.agent().unwrap_or("-"),
                    "Progress event"
                );
                snapshots.send_modify(|snapshot| *snapshot = reduce(snapshot, &event));
            }
            ReducerInput::Channel(ChannelEvent::Message(ServerMessage::Control(control))) => {
                tracing::trace!(?control, "Control message");
            }
        }
    }
    tracing::debug!("Progress reducer stopped");
}

async fn run_cleanup(policy: CleanupPolicy, snapshots: Arc<watch::Sender<ProgressSnapshot>>) {
    let Some(period) = policy.interval else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        snapshots.send_if_modified(|snapshot| {
            if !policy.should_force_clear(snapshot) {
                return false;
            }
            let (next, cleared) = policy.apply(std::mem::take(snapshot));
            *snapshot = next;
            cleared
        });
    }
}
