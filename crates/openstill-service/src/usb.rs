//! libusb host-controller backend.
//!
//! Implements the engine's controller seam over `rusb`. Streaming reads
//! poll with a short timeout so `cancel_stream` takes effect promptly;
//! libusb's synchronous API has no other cancellation point.
//!
//! Isochronous endpoints are not driven by this backend (the sync API
//! cannot submit them); cameras exposing only an isochronous streaming
//! alternate fail bring-up with a clear error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use openstill_engine::{ControlSetup, HostController, PacketTable};
use openstill_errors::{TransportError, TransportResult};
use rusb::{Context, DeviceHandle};
use tracing::debug;

/// Poll granularity for cancellable blocking reads.
const STREAM_POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct RusbHostController {
    handle: DeviceHandle<Context>,
    endpoint_address: u8,
    status_endpoint: Option<u8>,
    use_bulk: bool,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for RusbHostController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbHostController")
            .field("endpoint_address", &self.endpoint_address)
            .field("use_bulk", &self.use_bulk)
            .finish()
    }
}

fn map_usb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::timeout(STREAM_POLL_TIMEOUT.as_millis() as u64),
        rusb::Error::Pipe => TransportError::Stall,
        rusb::Error::NoDevice => TransportError::Disconnected,
        rusb::Error::Io => TransportError::Other("usb i/o error".into()),
        rusb::Error::Busy => TransportError::Submit("endpoint busy".into()),
        other => TransportError::Other(other.to_string()),
    }
}

impl RusbHostController {
    pub fn new(
        handle: DeviceHandle<Context>,
        endpoint_address: u8,
        status_endpoint: Option<u8>,
        use_bulk: bool,
    ) -> Self {
        Self {
            handle,
            endpoint_address,
            status_endpoint,
            use_bulk,
            cancelled: AtomicBool::new(false),
        }
    }

    fn request_type(device_to_host: bool) -> u8 {
        let direction = if device_to_host {
            rusb::Direction::In
        } else {
            rusb::Direction::Out
        };
        rusb::request_type(direction, rusb::RequestType::Class, rusb::Recipient::Interface)
    }

    fn wire_value(setup: &ControlSetup) -> (u16, u16) {
        let value = (setup.selector as u16) << 8;
        let index = (setup.unit as u16) << 8 | setup.interface as u16;
        (value, index)
    }

    /// Cancellable blocking read shared by the streaming and interrupt
    /// paths.
    fn polled_read(
        &self,
        read: impl Fn(&mut [u8], Duration) -> rusb::Result<usize>,
        buf: &mut [u8],
    ) -> TransportResult<usize> {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(TransportError::Shutdown);
            }
            match read(buf, STREAM_POLL_TIMEOUT) {
                Ok(n) => return Ok(n),
                Err(rusb::Error::Timeout) => continue,
                Err(err) => return Err(map_usb_error(err)),
            }
        }
    }
}

impl HostController for RusbHostController {
    fn control_out(&self, setup: &ControlSetup, data: &[u8]) -> TransportResult<()> {
        let (value, index) = Self::wire_value(setup);
        let written = self
            .handle
            .write_control(
                Self::request_type(false),
                setup.request,
                value,
                index,
                data,
                setup.timeout,
            )
            .map_err(|err| match err {
                rusb::Error::Timeout => {
                    TransportError::timeout(setup.timeout.as_millis() as u64)
                }
                other => map_usb_error(other),
            })?;
        if written != data.len() {
            return Err(TransportError::short(data.len(), written));
        }
        Ok(())
    }

    fn control_in(&self, setup: &ControlSetup, data: &mut [u8]) -> TransportResult<usize> {
        let (value, index) = Self::wire_value(setup);
        self.handle
            .read_control(
                Self::request_type(true),
                setup.request,
                value,
                index,
                data,
                setup.timeout,
            )
            .map_err(|err| match err {
                rusb::Error::Timeout => {
                    TransportError::timeout(setup.timeout.as_millis() as u64)
                }
                other => map_usb_error(other),
            })
    }

    fn set_alt_setting(&self, interface: u8, alt: u8) -> TransportResult<()> {
        debug!(interface, alt, "set alternate setting");
        self.handle
            .set_alternate_setting(interface, alt)
            .map_err(map_usb_error)
    }

    fn stream_in(&self, buf: &mut [u8], table: &mut PacketTable) -> TransportResult<()> {
        if !self.use_bulk {
            return Err(TransportError::Unsupported(
                "isochronous streaming requires an async usb backend".into(),
            ));
        }
        let endpoint = self.endpoint_address;
        let n = self.polled_read(
            |buf, timeout| self.handle.read_bulk(endpoint, buf, timeout),
            buf,
        )?;
        table.push(0, n, true);
        Ok(())
    }

    fn cancel_stream(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn resume_stream(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    fn interrupt_in(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let Some(endpoint) = self.status_endpoint else {
            return Err(TransportError::Unsupported("no status endpoint".into()));
        };
        self.polled_read(
            |buf, timeout| self.handle.read_interrupt(endpoint, buf, timeout),
            buf,
        )
    }
}
