//! # a11y-progress-core
//!
//! Core library for following accessibility-analysis jobs in real time.
//!
//! This library provides:
//! - The progress stream wire contract
//! - A reconnecting WebSocket channel for one job's event stream
//! - A pure reducer that folds events into a bounded snapshot
//! - A REST client for the backend's progress endpoints
//! - Configuration, logging and persisted client preferences
//!
//! ## Architecture
//!
//! ```text
//! server ──frames──▶ ProgressChannel ──ChannelEvent──▶ ProgressMonitor ──reduce()──▶ ProgressSnapshot
//! ```
//!
//! The channel knows nothing about the reducer; the reducer knows nothing
//! about transports.
//!
//! ## Example
//!
//! ```rust,no_run
//! use a11y_progress_core::{Config, ProgressMonitor};
//!
//! # async fn run() -> a11y_progress_core::Result<()> {
//! let config = Config::load()?;
//! let monitor = ProgressMonitor::with_websocket(&config);
//! monitor.open("3f2a9c");
//!
//! let mut snapshots = monitor.subscribe();
//! while snapshots.changed().await.is_ok() {
//!     let snapshot = snapshots.borrow().clone();
//!     println!("active: {:?}", snapshot.active_agents);
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use channel::{ChannelError, ConnectionState, ConnectionStatus, ProgressChannel};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{ClientMessage, EventKind, ProgressEvent, ServerMessage};
pub use monitor::ProgressMonitor;
pub use progress::{reduce, CleanupPolicy, ProgressSnapshot};

// Public modules
pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod logging;
pub mod monitor;
pub mod progress;
pub mod store;
