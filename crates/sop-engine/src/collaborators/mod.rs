//! External collaborators called by the engine.
//!
//! - [`QualityCheckSink`]: synchronous, must succeed before a step that
//!   requires a quality check is recorded
//! - [`Notifier`]: fire-and-forget, failures are logged and ignored

pub mod memory;
pub mod notify;
pub mod quality;

use thiserror::Error;

pub use memory::{RecordingNotifier, RecordingQualityChecks};
pub use notify::{Notification, Notifier, TracingNotifier};
pub use quality::{QualityCheckPayload, QualityCheckSink};

/// Failure reported by a collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached. Worth retrying.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request.
    #[error("collaborator rejected the request: {0}")]
    Rejected(String),
}
