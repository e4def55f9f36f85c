//! Error taxonomy (spec §7).
//!
//! Each variant names what it signals to a caller, not which module raised
//! it — several components raise `BackendUnavailable`, for instance. The
//! `kind()` accessor lets status/admin surfaces report a stable string
//! without matching on the full enum.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Caller error, rejected at the API boundary before any work starts.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No port available, queue full of higher-or-equal priority entries,
    /// or the worker pool saturated past its threshold.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Recoverable by the decoder's own reconnect policy.
    #[error("stream lost for camera {camera_id}: {reason}")]
    StreamLost { camera_id: String, reason: String },

    /// Inferencer/model load or inference failure.
    #[error("inference backend unavailable: {0}")]
    BackendUnavailable(String),

    /// One channel, one alarm. Never propagates to other channels/alarms.
    #[error("alarm delivery failed via {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    /// A camera id that already has a pipeline.
    #[error("camera '{0}' already exists")]
    AlreadyExists(String),

    /// A camera id with no matching pipeline.
    #[error("camera '{0}' not found")]
    NotFound(String),

    /// Invariant violation severe enough that process state can no longer
    /// be trusted. Logged, then the process aborts (see [`abort_fatal`]).
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigInvalid(_) => "ConfigInvalid",
            AppError::ResourceExhausted(_) => "ResourceExhausted",
            AppError::StreamLost { .. } => "StreamLost",
            AppError::BackendUnavailable(_) => "BackendUnavailable",
            AppError::DeliveryFailed { .. } => "DeliveryFailed",
            AppError::AlreadyExists(_) => "AlreadyExists",
            AppError::NotFound(_) => "NotFound",
            AppError::Fatal(_) => "Fatal",
        }
    }

    /// A single-line, user-visible reason (spec §7 "single-line reason").
    pub fn reason_line(&self) -> String {
        self.to_string().replace('\n', " ")
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Logs and aborts the process. Reserved for the `Fatal` kind: memory
/// corruption or an invariant violation that makes further execution
/// unsound to continue (spec §7).
pub fn abort_fatal(err: &AppError) -> ! {
    tracing::error!(error = %err, "fatal invariant violation, aborting process");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(AppError::ConfigInvalid("x".into()).kind(), "ConfigInvalid");
        assert_eq!(
            AppError::StreamLost {
                camera_id: "cam1".into(),
                reason: "timeout".into()
            }
            .kind(),
            "StreamLost"
        );
    }

    #[test]
    fn reason_line_has_no_embedded_newlines() {
        let err = AppError::ConfigInvalid("bad\nvalue".into());
        assert!(!err.reason_line().contains('\n'));
    }
}
