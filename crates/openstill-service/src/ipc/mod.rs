//! The socket surface.
//!
//! Each device gets one Unix socket speaking a strict request/response
//! protocol that mirrors file semantics: open, read, write, ioctl,
//! release. Status codes are the errno values a character device would
//! return, so clients port over unchanged.

pub mod codec;
pub mod server;

pub use codec::{IpcError, MessageCodec, Op, Request, Response};
pub use server::DeviceServer;
