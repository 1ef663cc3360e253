//! REST companion to the progress stream
//!
//! The backend exposes, next to the WebSocket endpoint:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/api/progress/{upload_id}/connections` | listeners for one upload |
//! | GET | `/api/progress/connections` | listeners for all uploads |
//! | POST | `/api/progress/{upload_id}/send` | publish a progress event |
//! | POST | `/api/progress/{upload_id}/broadcast` | publish a free-form message |

mod client;

pub use client::{Acknowledgement, ConnectionInfo, ConnectionSummary, ProgressApiClient};
