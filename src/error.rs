//! Error types for the driver.
//!
//! Two layers of errors exist:
//!
//! - **`SdkError`**: a failure reported by the camera SDK collaborator. Every SDK
//!   call may fail; the lifecycle controller catches these at the transition
//!   action boundary and turns them into a branch outcome, never a fault.
//! - **`DriverError`**: everything else the crate can report to its host, from
//!   configuration problems to a full event queue.
//!
//! Data-integrity anomalies (missing frames, queue overflow) are *not* errors:
//! they are counted in the observable status and acquisition continues.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type AppResult<T> = std::result::Result<T, DriverError>;

/// A failed camera SDK call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("SDK call '{operation}' failed (code {code:#010x}): {message}")]
pub struct SdkError {
    /// The SDK operation that failed (e.g. `"open_camera"`).
    pub operation: &'static str,
    /// Vendor error code.
    pub code: u32,
    /// Human readable detail.
    pub message: String,
}

impl SdkError {
    pub fn new(operation: &'static str, code: u32, message: impl Into<String>) -> Self {
        Self {
            operation,
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Sdk(#[from] SdkError),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Event queue full ({capacity} pending), dropped event '{event}'")]
    QueueFull { event: String, capacity: usize },

    #[error("Event queue closed")]
    QueueClosed,

    #[error("Driver '{0}' already registered")]
    DuplicateDriver(String),

    #[error("Driver '{0}' not found")]
    DriverNotFound(String),

    #[error("Failed to spawn state machine thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("State machine thread panicked")]
    ThreadPanicked,
}

impl From<figment::Error> for DriverError {
    fn from(value: figment::Error) -> Self {
        DriverError::Config(Box::new(value))
    }
}

impl DriverError {
    /// Whether the condition can clear without operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Sdk(_) | DriverError::OutOfMemory(_) | DriverError::QueueFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_error_display_includes_operation_and_code() {
        let err = SdkError::new("arm_camera", 0x8000_2001, "camera busy");
        let text = err.to_string();
        assert!(text.contains("arm_camera"));
        assert!(text.contains("0x80002001"));
        assert!(text.contains("camera busy"));
    }

    #[test]
    fn sdk_error_converts_into_driver_error() {
        let err: DriverError = SdkError::new("open_camera", 1, "no camera").into();
        assert!(matches!(err, DriverError::Sdk(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn configuration_errors_are_not_transient() {
        let err = DriverError::Configuration("bad".into());
        assert!(!err.is_transient());
        assert!(!DriverError::DuplicateDriver("pco1".into()).is_transient());
    }
}
