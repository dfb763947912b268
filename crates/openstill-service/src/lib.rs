//! OpenStill service: USB plumbing and the daemon surface.
//!
//! The engine crate is hardware-free; this crate supplies the real
//! [`openstill_engine::HostController`] over libusb, discovers cameras,
//! and re-presents each device's file semantics over a Unix socket so
//! unprivileged clients keep the familiar open/read/ioctl/close model.

pub mod config;
pub mod daemon;
pub mod enumerate;
pub mod ipc;
pub mod usb;

pub use config::ServiceConfig;
pub use daemon::Daemon;
