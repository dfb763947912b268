//! Device-file boundary errors.
//!
//! Readers and ioctl callers receive these; each maps to the errno a
//! character device would return, and the numeric codes are part of the
//! external contract.

use crate::{Severity, TransportError};

/// Errors surfaced at the `open`/`read`/`ioctl` boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// No data and the handle is non-blocking (EAGAIN).
    #[error("no frame data available")]
    WouldBlock,

    /// A blocking wait was interrupted (ERESTARTSYS).
    #[error("wait interrupted")]
    Interrupted,

    /// The capture ended in error; typically a still interrupted by
    /// video packets (EIO).
    #[error("frame capture failed: {0}")]
    Io(String),

    /// The device is terminating or already gone (EFAULT).
    #[error("device is gone")]
    DeviceGone,

    /// Another handle holds the device and exclusive access is enabled
    /// (EBUSY).
    #[error("device is busy")]
    Busy,

    /// Malformed argument from the caller (EINVAL).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested dimensions are not in the device's catalogue
    /// (EINVAL).
    #[error("unsupported frame size {width}x{height}")]
    UnsupportedFrameSize {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },

    /// A buffer or envelope did not fit (ENOMEM).
    #[error("out of buffer space")]
    NoMemory,

    /// Unknown ioctl command (ENOTTY).
    #[error("unknown ioctl command {0}")]
    UnknownIoctl(u32),

    /// The operation needs an active stream and there is none.
    #[error("device is not streaming")]
    NotStreaming,

    /// A control transfer failed underneath an ioctl.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CaptureError {
    /// The errno value a character device would return, negated.
    pub fn errno(&self) -> i32 {
        match self {
            CaptureError::WouldBlock => -11,              // EAGAIN
            CaptureError::Interrupted => -512,            // ERESTARTSYS
            CaptureError::Io(_) => -5,                    // EIO
            CaptureError::DeviceGone => -14,              // EFAULT
            CaptureError::Busy => -16,                    // EBUSY
            CaptureError::InvalidArgument(_) => -22,      // EINVAL
            CaptureError::UnsupportedFrameSize { .. } => -22,
            CaptureError::NoMemory => -12,                // ENOMEM
            CaptureError::UnknownIoctl(_) => -25,         // ENOTTY
            CaptureError::NotStreaming => -5,             // EIO
            CaptureError::Transport(t) => match t {
                TransportError::Timeout { .. } => -110,   // ETIMEDOUT
                TransportError::Shutdown | TransportError::Disconnected => -14,
                _ => -5,
            },
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CaptureError::WouldBlock | CaptureError::Interrupted => Severity::Info,
            CaptureError::Busy => Severity::Warning,
            CaptureError::InvalidArgument(_)
            | CaptureError::UnsupportedFrameSize { .. }
            | CaptureError::UnknownIoctl(_) => Severity::Warning,
            CaptureError::Io(_) | CaptureError::NoMemory | CaptureError::NotStreaming => {
                Severity::Error
            }
            CaptureError::DeviceGone => Severity::Critical,
            CaptureError::Transport(t) => t.severity(),
        }
    }

    /// Whether the same call can simply be reissued.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::WouldBlock | CaptureError::Interrupted | CaptureError::Busy
        )
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        CaptureError::InvalidArgument(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        CaptureError::Io(message.into())
    }

    pub fn unsupported_frame_size(width: u32, height: u32) -> Self {
        CaptureError::UnsupportedFrameSize { width, height }
    }
}
