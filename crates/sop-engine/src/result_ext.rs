//! Result extension trait for logging errors with context.

use std::fmt::Display;
use std::panic::Location;

use tracing::error;

/// Adds a `log` method to `Result` that records failures with the caller's
/// source location before passing the result through unchanged.
///
/// ```ignore
/// use sop_engine::ResultExt;
///
/// let file = std::fs::File::open(&path).log("opening journal")?;
/// ```
pub trait ResultExt<T, E> {
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(e) = &self {
            let location = Location::caller();
            error!(
                target: "sop_engine",
                %location,
                error = %e,
                "{} failed",
                context.to_string()
            );
        }
        self
    }
}
