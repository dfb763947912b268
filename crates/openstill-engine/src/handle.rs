//! An open handle on a still device.
//!
//! Mirrors file-descriptor semantics: `read` drains the current frame,
//! `write` is a no-op, `ioctl` dispatches the command table, and drop is
//! release. A handle can be interrupted from another thread, which makes
//! a blocked read return the interrupted error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use openstill_errors::Result;

use crate::device::StillDevice;

/// One open session on a device.
#[derive(Debug)]
pub struct CaptureHandle {
    dev: Arc<StillDevice>,
    nonblocking: bool,
    interrupted: Arc<AtomicBool>,
}

/// Wakes a blocked read on the owning handle. Held by whoever manages
/// the caller's lifetime (for instance a connection task).
#[derive(Debug, Clone)]
pub struct ReadInterrupter {
    dev: Arc<StillDevice>,
    interrupted: Arc<AtomicBool>,
}

impl ReadInterrupter {
    /// Make any blocked or future read on the handle fail with the
    /// interrupted error.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.dev.wake_readers();
    }
}

impl CaptureHandle {
    pub(crate) fn new(dev: Arc<StillDevice>, nonblocking: bool) -> Self {
        Self {
            dev,
            nonblocking,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device(&self) -> &Arc<StillDevice> {
        &self.dev
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn interrupter(&self) -> ReadInterrupter {
        ReadInterrupter {
            dev: Arc::clone(&self.dev),
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    /// Read part of the most recently captured frame. Returns 0 at end
    /// of frame.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        self.dev.read_frame(out, self.nonblocking, &self.interrupted)
    }

    /// Writes are accepted and discarded.
    pub fn write(&self, _data: &[u8]) -> Result<usize> {
        Ok(0)
    }

    /// Dispatch an ioctl against this device.
    pub fn ioctl(&self, code: u32, payload: &[u8]) -> Result<Vec<u8>> {
        self.dev.ioctl(code, payload)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.dev.release();
    }
}
