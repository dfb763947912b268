//! The host-controller seam.
//!
//! The engine never talks to libusb directly. Everything it needs from
//! the USB stack is expressed by [`HostController`], which the service
//! implements over real hardware and tests implement with scripted
//! packet streams.

use std::time::Duration;

use openstill_errors::TransportResult;

/// Per-transfer packet limit for isochronous endpoints.
pub const MAX_PACKETS_PER_TRANSFER: usize = 32;

/// Addressing and timing for one class control request.
///
/// `wValue` and `wIndex` on the wire are derived by the backend as
/// `selector << 8` and `unit << 8 | interface`.
#[derive(Debug, Clone, Copy)]
pub struct ControlSetup {
    /// Class request code (SET_CUR, GET_CUR, ...).
    pub request: u8,
    /// Control selector.
    pub selector: u8,
    /// Entity id, or 0 when addressing the streaming interface itself.
    pub unit: u8,
    /// Interface number.
    pub interface: u8,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

/// Per-packet completion records for one streaming transfer.
///
/// Bulk transfers report a single packet spanning the transferred bytes.
/// Isochronous transfers report up to [`MAX_PACKETS_PER_TRANSFER`]
/// entries; packets that completed with an error have `ok == false` and
/// must not be forwarded.
#[derive(Debug, Clone)]
pub struct PacketTable {
    entries: [PacketEntry; MAX_PACKETS_PER_TRANSFER],
    count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PacketEntry {
    pub offset: usize,
    pub len: usize,
    pub ok: bool,
}

impl Default for PacketTable {
    fn default() -> Self {
        Self {
            entries: [PacketEntry::default(); MAX_PACKETS_PER_TRANSFER],
            count: 0,
        }
    }
}

impl PacketTable {
    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Record one completed packet. Entries past the limit are dropped.
    pub fn push(&mut self, offset: usize, len: usize, ok: bool) {
        if self.count < MAX_PACKETS_PER_TRANSFER {
            self.entries[self.count] = PacketEntry { offset, len, ok };
            self.count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn entries(&self) -> &[PacketEntry] {
        &self.entries[..self.count]
    }
}

/// What the engine requires of a USB host controller.
///
/// Implementations must be callable from multiple threads: control
/// requests arrive from ioctl callers while `stream_in` blocks on the
/// pump thread.
pub trait HostController: Send + Sync {
    /// Host-to-device class control transfer.
    fn control_out(&self, setup: &ControlSetup, data: &[u8]) -> TransportResult<()>;

    /// Device-to-host class control transfer. Returns bytes received.
    fn control_in(&self, setup: &ControlSetup, data: &mut [u8]) -> TransportResult<usize>;

    /// Select an alternate setting on an interface.
    fn set_alt_setting(&self, interface: u8, alt: u8) -> TransportResult<()>;

    /// Block until one streaming transfer completes, filling `buf` and
    /// describing the packets in `table`.
    ///
    /// Must return [`openstill_errors::TransportError::Shutdown`] when
    /// [`HostController::cancel_stream`] is called while blocked, and
    /// for every call after that until streaming is re-armed by the
    /// backend.
    fn stream_in(&self, buf: &mut [u8], table: &mut PacketTable) -> TransportResult<()>;

    /// Abort a blocked `stream_in` or `interrupt_in` and fail fast until
    /// re-armed.
    fn cancel_stream(&self);

    /// Re-arm streaming after a `cancel_stream`.
    fn resume_stream(&self);

    /// Block until the status interrupt endpoint delivers a packet.
    /// Backends without a status endpoint may return `Unsupported`.
    fn interrupt_in(&self, buf: &mut [u8]) -> TransportResult<usize>;
}
