//! Centralized error types for OpenStill.
//!
//! Two layers are distinguished:
//!
//! - [`transport`]: what the USB host controller reports (timeouts,
//!   stalls, shutdown). Consumed inside the engine; retry decisions are
//!   made against these.
//! - [`capture`]: what the device-file boundary reports to callers. The
//!   variants correspond one-to-one to the errno values a character
//!   device would return, and [`CaptureError::errno`] preserves those
//!   numeric codes for the socket surface.

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(rust_2018_idioms)]

pub mod capture;
pub mod transport;

pub use capture::CaptureError;
pub use transport::TransportError;

/// A specialized `Result` for boundary operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// A specialized `Result` for host-controller operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Coarse severity classification, used to pick log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}
