//! Host-controller error types.
//!
//! These are produced by the USB backend and consumed by the engine's
//! control plane and transfer ring. Only [`TransportError::Timeout`] is
//! retried; [`TransportError::Shutdown`] means the device is going away
//! and nothing may be resubmitted.

use crate::Severity;

/// Errors reported by the host controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Control transfer timed out.
    #[error("control transfer timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Endpoint stalled the request.
    #[error("endpoint stall")]
    Stall,

    /// The device or host stack is shutting down; do not resubmit.
    #[error("transfer aborted by shutdown")]
    Shutdown,

    /// Device disappeared from the bus.
    #[error("device disconnected")]
    Disconnected,

    /// Transfer completed with fewer bytes than required.
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        /// Bytes required
        expected: usize,
        /// Bytes transferred
        actual: usize,
    },

    /// The backend cannot drive this endpoint type.
    #[error("unsupported transfer type: {0}")]
    Unsupported(String),

    /// Submission to the host stack failed.
    #[error("transfer submit failed: {0}")]
    Submit(String),

    /// Anything else the backend reports.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn severity(&self) -> Severity {
        match self {
            TransportError::Timeout { .. } => Severity::Warning,
            TransportError::Stall => Severity::Warning,
            TransportError::Shutdown => Severity::Info,
            TransportError::Disconnected => Severity::Critical,
            TransportError::ShortTransfer { .. } => Severity::Error,
            TransportError::Unsupported(_) => Severity::Error,
            TransportError::Submit(_) => Severity::Error,
            TransportError::Other(_) => Severity::Error,
        }
    }

    /// Whether a retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// Whether the device is gone and resubmission is forbidden.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Shutdown | TransportError::Disconnected)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        TransportError::Timeout { timeout_ms }
    }

    pub fn short(expected: usize, actual: usize) -> Self {
        TransportError::ShortTransfer { expected, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        assert!(TransportError::timeout(300).is_retryable());
        assert!(!TransportError::Stall.is_retryable());
        assert!(!TransportError::Shutdown.is_retryable());
        assert!(!TransportError::short(26, 12).is_retryable());
    }

    #[test]
    fn shutdown_and_disconnect_are_fatal() {
        assert!(TransportError::Shutdown.is_fatal());
        assert!(TransportError::Disconnected.is_fatal());
        assert!(!TransportError::timeout(300).is_fatal());
    }

    #[test]
    fn display_includes_byte_counts() {
        let msg = TransportError::short(26, 12).to_string();
        assert!(msg.contains("26"));
        assert!(msg.contains("12"));
    }
}
