//! Device lifecycle and operations.
//!
//! A [`StillDevice`] is created when a matching USB interface is probed
//! and destroyed on disconnect. It owns the pool, the frame buffer, the
//! state machine, and the service threads; everything else borrows from
//! it for the duration of one operation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use openstill_errors::{CaptureError, Result, TransportError};
use openstill_uvc_protocol::{
    is_valid_get_request, is_valid_set_request, DeviceQuirks, FrameSize, UnitProperty,
    MAX_PROPERTY_ENVELOPE, PROPERTY_HEADER_LEN,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capture::CapturePipeline;
use crate::control_plane::{ControlPlane, CTRL_TIMEOUT};
pub use crate::control_plane::UnitIds;
use crate::controller::{HostController, MAX_PACKETS_PER_TRANSFER};
use crate::frame_buf::{FrameBuffer, FRAME_BUF_NUM_PAGES};
use crate::handle::CaptureHandle;
use crate::ioctl::{codes, FrameSizeArg, UnitKind};
use crate::pool::{BufferPool, NUM_INITIAL_POOL_BUFFERS, POOL_BUFFER_LIMIT};
use crate::stats::CaptureStats;
use crate::status::{CaptureState, StatusCell};
use crate::stream::StreamEngine;

/// Bring-up retries for the whole negotiation sequence.
const PROBE_RETRIES: u32 = 3;

/// Status interrupt endpoint read size.
const INTERRUPT_BUF_SIZE: usize = 16;

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(0);

/// Everything the engine needs to know about a camera, harvested from
/// its descriptors before probe.
#[derive(Debug, Clone)]
pub struct DeviceDescription {
    pub vendor_id: u16,
    pub product_id: u16,
    pub control_interface: u8,
    pub streaming_interface: u8,
    /// Streaming data endpoint address.
    pub endpoint_address: u8,
    /// Optional status interrupt endpoint on the control interface.
    pub status_endpoint: Option<u8>,
    /// Alternate setting with the largest per-packet maximum.
    pub max_bandwidth_alt: u8,
    /// Bulk transport (vs isochronous).
    pub use_bulk: bool,
    /// Decoded bytes-per-interval of the chosen endpoint.
    pub max_packet_size: u32,
    pub units: UnitIds,
    /// Still frame-size catalogue, in descriptor order.
    pub frame_sizes: Vec<FrameSize>,
    /// Initially selected catalogue index.
    pub initial_frame_index: usize,
}

/// Operator-adjustable knobs with production defaults.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Fail a second open while one handle is live.
    pub exclusive_access: bool,
    pub initial_pool_buffers: usize,
    pub pool_buffer_limit: usize,
    pub frame_buf_pages: usize,
    pub ctrl_timeout: Duration,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            exclusive_access: false,
            initial_pool_buffers: NUM_INITIAL_POOL_BUFFERS,
            pool_buffer_limit: POOL_BUFFER_LIMIT,
            frame_buf_pages: FRAME_BUF_NUM_PAGES,
            ctrl_timeout: CTRL_TIMEOUT,
        }
    }
}

/// One attached camera.
pub struct StillDevice {
    id: u32,
    desc: DeviceDescription,
    ctl: Arc<dyn HostController>,
    plane: ControlPlane,
    status: Arc<StatusCell>,
    frame: Arc<FrameBuffer>,
    stats: Arc<CaptureStats>,
    pool: Arc<BufferPool>,
    engine: Arc<StreamEngine>,
    tuning: EngineTuning,
    selected_frame: Mutex<usize>,
    /// Serializes readers so none observes an interleaved prefix of
    /// another's frame.
    read_lock: Mutex<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for StillDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StillDevice")
            .field("id", &self.id)
            .field("vendor_id", &self.desc.vendor_id)
            .field("product_id", &self.desc.product_id)
            .finish()
    }
}

impl StillDevice {
    /// Bring up a probed camera: suspend the stream, negotiate still and
    /// video parameters (retrying the whole sequence on failure), enable
    /// the max-bandwidth alternate, and start the service threads.
    pub fn probe(
        ctl: Arc<dyn HostController>,
        desc: DeviceDescription,
        tuning: EngineTuning,
    ) -> Result<Arc<Self>> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            id,
            vendor = format_args!("{:04x}", desc.vendor_id),
            product = format_args!("{:04x}", desc.product_id),
            "probing device"
        );

        if desc.frame_sizes.is_empty() {
            return Err(CaptureError::invalid("no still frame sizes advertised"));
        }

        let quirks = DeviceQuirks::for_device(desc.vendor_id, desc.product_id);
        if quirks.has_quirks() {
            debug!(id, ?quirks, "applying device quirks");
        }

        let plane = ControlPlane::new(
            Arc::clone(&ctl),
            desc.control_interface,
            desc.streaming_interface,
            desc.units,
            quirks,
            tuning.ctrl_timeout,
        );

        let selected = desc.initial_frame_index.min(desc.frame_sizes.len() - 1);

        // The hardware occasionally fumbles the first negotiation after
        // an alternate-setting reset; retry the whole command sequence.
        let mut attempt = 0;
        let max_payload = loop {
            let outcome = plane
                .select_alt(0)
                .and_then(|_| plane.negotiate_still(&desc.frame_sizes, selected))
                .and_then(|max_payload| plane.negotiate_video().map(|_| max_payload));
            match outcome {
                Ok(max_payload) => break max_payload,
                Err(err) => {
                    attempt += 1;
                    warn!(id, attempt, error = %err, "bring-up negotiation failed");
                    if attempt > PROBE_RETRIES {
                        return Err(err.into());
                    }
                }
            }
        };

        plane.select_alt(desc.max_bandwidth_alt)?;

        let buf_len = if desc.use_bulk {
            max_payload as usize
        } else {
            desc.max_packet_size as usize * MAX_PACKETS_PER_TRANSFER
        };
        if buf_len == 0 {
            return Err(CaptureError::invalid("zero-length transfer buffer"));
        }
        debug!(id, buf_len, bulk = desc.use_bulk, "transfer buffers sized");

        let status = Arc::new(StatusCell::new());
        status.set_streaming(true);

        let dev = Arc::new(Self {
            id,
            ctl,
            plane,
            status,
            frame: Arc::new(FrameBuffer::with_pages(tuning.frame_buf_pages)),
            stats: Arc::new(CaptureStats::new()),
            pool: Arc::new(BufferPool::new(
                buf_len,
                tuning.initial_pool_buffers,
                tuning.pool_buffer_limit,
            )),
            engine: Arc::new(StreamEngine::new()),
            tuning,
            selected_frame: Mutex::new(selected),
            read_lock: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
            desc,
        });

        dev.spawn_service_threads();
        dev.engine.ring().submit_all(&dev.pool);
        info!(id, "device ready");
        Ok(dev)
    }

    fn spawn_service_threads(&self) {
        let mut threads = self.threads.lock();

        {
            let engine = Arc::clone(&self.engine);
            let ctl = Arc::clone(&self.ctl);
            let pool = Arc::clone(&self.pool);
            let status = Arc::clone(&self.status);
            let stats = Arc::clone(&self.stats);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("still{}-pump", self.id))
                    .spawn(move || engine.run_pump(&*ctl, &pool, &status, &stats))
                    .expect("spawn pump thread"),
            );
        }

        {
            let engine = Arc::clone(&self.engine);
            let pool = Arc::clone(&self.pool);
            let status = Arc::clone(&self.status);
            let pipeline = CapturePipeline::new(
                Arc::clone(&self.status),
                Arc::clone(&self.frame),
                Arc::clone(&self.stats),
            );
            threads.push(
                std::thread::Builder::new()
                    .name(format!("still{}-worker", self.id))
                    .spawn(move || engine.run_worker(&pool, &pipeline, &status))
                    .expect("spawn worker thread"),
            );
        }

        if self.desc.status_endpoint.is_some() {
            let ctl = Arc::clone(&self.ctl);
            let status = Arc::clone(&self.status);
            let id = self.id;
            threads.push(
                std::thread::Builder::new()
                    .name(format!("still{id}-intr"))
                    .spawn(move || {
                        let mut buf = [0u8; INTERRUPT_BUF_SIZE];
                        while !status.terminating() {
                            match ctl.interrupt_in(&mut buf) {
                                Ok(n) => debug!(id, bytes = n, "status interrupt"),
                                Err(err) if err.is_fatal() => break,
                                Err(TransportError::Unsupported(_)) => break,
                                Err(err) => debug!(id, error = %err, "status interrupt error"),
                            }
                        }
                    })
                    .expect("spawn interrupt thread"),
            );
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.desc
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn state(&self) -> CaptureState {
        self.status.state()
    }

    /// Transfer requests currently submitted.
    pub fn active_transfers(&self) -> usize {
        self.engine.ring().active_slots()
    }

    // ── File semantics ──────────────────────────────────────────────

    /// Open the device. With exclusive access enabled, a second open
    /// fails busy.
    pub fn open(self: &Arc<Self>, nonblocking: bool) -> Result<CaptureHandle> {
        if self.status.terminating() {
            return Err(CaptureError::DeviceGone);
        }
        if !self.status.try_set_busy(self.tuning.exclusive_access) {
            return Err(CaptureError::Busy);
        }
        debug!(id = self.id, "device opened");
        Ok(CaptureHandle::new(Arc::clone(self), nonblocking))
    }

    pub(crate) fn wake_readers(&self) {
        self.status.wake_readers();
    }

    /// Close: clear busy and reset state so a stale result does not
    /// poison the next session.
    pub(crate) fn release(&self) {
        debug!(id = self.id, "device released");
        self.status.release();
    }

    /// Read still bytes. Blocks (unless `nonblocking`) until data, a
    /// finished frame, an error, interruption, or termination.
    pub(crate) fn read_frame(
        &self,
        out: &mut [u8],
        nonblocking: bool,
        interrupted: &AtomicBool,
    ) -> Result<usize> {
        let _readers = self.read_lock.lock();

        loop {
            if self.frame.available() > 0 {
                break;
            }
            if self
                .status
                .transition_if(CaptureState::Success, CaptureState::Waiting)
            {
                debug!(id = self.id, "read finished");
                return Ok(0);
            }
            if self
                .status
                .transition_if(CaptureState::Error, CaptureState::Waiting)
            {
                debug!(id = self.id, "read error");
                return Err(CaptureError::io("still capture interrupted"));
            }
            if self.status.terminating() {
                return Err(CaptureError::DeviceGone);
            }
            if interrupted.load(Ordering::Acquire) {
                return Err(CaptureError::Interrupted);
            }
            if nonblocking {
                return Err(CaptureError::WouldBlock);
            }
            self.status.wait_read_event(
                || self.frame.available() > 0,
                || interrupted.load(Ordering::Acquire),
            );
        }

        let mut copied = 0;
        while copied < out.len() {
            let n = self.frame.read_chunk(&mut out[copied..]);
            if n == 0 {
                break;
            }
            copied += n;
        }
        Ok(copied)
    }

    // ── Capture operations ──────────────────────────────────────────

    /// Block until the device is triggerable, then fire the trigger.
    pub fn trigger_still(&self) -> Result<()> {
        if !self.status.streaming() || !self.engine.ring().is_active() {
            warn!(id = self.id, "cannot trigger, device not streaming");
            return Err(CaptureError::NotStreaming);
        }
        if self.status.state() != CaptureState::Triggerable {
            debug!(id = self.id, "waiting for camera to be ready");
        }
        if !self.status.wait_until_triggerable() {
            return Err(CaptureError::DeviceGone);
        }

        self.frame.reset();
        self.plane.trigger_still()?;
        Ok(())
    }

    /// Select new dimensions; must match a catalogue entry exactly.
    /// Renegotiates both controls and resets the state machine.
    pub fn set_frame_size(&self, width: u32, height: u32) -> Result<()> {
        let index = self
            .desc
            .frame_sizes
            .iter()
            .position(|s| s.width == width && s.height == height)
            .ok_or_else(|| {
                debug!(id = self.id, width, height, "frame size not in catalogue");
                CaptureError::unsupported_frame_size(width, height)
            })?;

        *self.selected_frame.lock() = index;
        self.plane.negotiate_still(&self.desc.frame_sizes, index)?;
        self.plane.negotiate_video()?;
        self.status.force(CaptureState::Waiting);
        debug!(id = self.id, width, height, index, "frame size set");
        Ok(())
    }

    pub fn frame_size(&self) -> FrameSize {
        self.desc.frame_sizes[*self.selected_frame.lock()]
    }

    /// Renegotiate, re-enable the max-bandwidth alternate, and resubmit
    /// transfers.
    pub fn start(&self) -> Result<()> {
        self.status.set_streaming(true);
        let index = *self.selected_frame.lock();
        self.plane.negotiate_still(&self.desc.frame_sizes, index)?;
        self.plane.negotiate_video()?;
        self.plane.select_alt(self.desc.max_bandwidth_alt)?;
        self.status.reset_video_frame_count();
        self.status.force(CaptureState::Waiting);
        self.ctl.resume_stream();
        self.engine.ring().submit_all(&self.pool);
        Ok(())
    }

    /// Suspend the interface and kill transfers.
    pub fn stop(&self) -> Result<()> {
        self.plane.select_alt(0)?;
        self.engine.ring().kill_all(&*self.ctl, &self.pool);
        self.status.set_streaming(false);
        Ok(())
    }

    /// Kill outstanding transfers; streaming state is untouched.
    pub fn suspend(&self) {
        self.engine.ring().kill_all(&*self.ctl, &self.pool);
    }

    /// Resubmit transfers after a suspend.
    pub fn resume(&self) {
        self.ctl.resume_stream();
        self.engine.ring().submit_all(&self.pool);
    }

    // ── Properties ──────────────────────────────────────────────────

    fn unit_id(&self, kind: UnitKind) -> u8 {
        let units = self.plane.units();
        match kind {
            UnitKind::Camera => units.camera_terminal,
            UnitKind::Processing => units.processing_unit,
            UnitKind::Extension => units.extension_unit,
        }
    }

    fn check_envelope(data_len: usize) -> Result<()> {
        if PROPERTY_HEADER_LEN + data_len > MAX_PROPERTY_ENVELOPE {
            return Err(CaptureError::NoMemory);
        }
        Ok(())
    }

    /// SET_CUR a property on a terminal or unit.
    pub fn set_property(&self, kind: UnitKind, prop: &UnitProperty) -> Result<()> {
        Self::check_envelope(prop.data.len())?;
        if !is_valid_set_request(prop.request) {
            return Err(CaptureError::invalid("request not valid for a property set"));
        }
        let mut data = prop.data.clone();
        self.plane
            .unit_request(prop.request, self.unit_id(kind), prop.control_selector, &mut data)?;
        Ok(())
    }

    /// GET_* a property from a terminal or unit. `prop.data`'s length
    /// sets the read size; the bytes read come back.
    pub fn get_property(&self, kind: UnitKind, prop: &UnitProperty) -> Result<Vec<u8>> {
        Self::check_envelope(prop.data.len())?;
        if !is_valid_get_request(prop.request) {
            return Err(CaptureError::invalid("request not valid for a property get"));
        }
        let mut data = vec![0u8; prop.data.len()];
        self.plane
            .unit_request(prop.request, self.unit_id(kind), prop.control_selector, &mut data)?;
        Ok(data)
    }

    // ── Ioctl dispatch ──────────────────────────────────────────────

    /// Dispatch one ioctl. The payload and result are the raw argument
    /// bytes a character device would exchange through the user pointer.
    pub fn ioctl(&self, code: u32, payload: &[u8]) -> Result<Vec<u8>> {
        debug!(id = self.id, code, "ioctl");
        match code {
            codes::TRIGGER_STILL_IMAGE => self.trigger_still().map(|_| Vec::new()),
            codes::SET_FRAME_SIZE => {
                let arg = FrameSizeArg::parse(payload)
                    .ok_or_else(|| CaptureError::invalid("short frame-size argument"))?;
                self.set_frame_size(arg.width, arg.height).map(|_| Vec::new())
            }
            codes::GET_FRAME_SIZE => {
                let size = self.frame_size();
                Ok(FrameSizeArg {
                    width: size.width,
                    height: size.height,
                }
                .encode()
                .to_vec())
            }
            codes::SUSPEND => {
                self.suspend();
                Ok(Vec::new())
            }
            codes::RESUME => {
                self.resume();
                Ok(Vec::new())
            }
            codes::SET_CAMERA_PROPERTY => self.property_set_ioctl(UnitKind::Camera, payload),
            codes::GET_CAMERA_PROPERTY => self.property_get_ioctl(UnitKind::Camera, payload),
            codes::SET_PROCESSING_PROPERTY => self.property_set_ioctl(UnitKind::Processing, payload),
            codes::GET_PROCESSING_PROPERTY => self.property_get_ioctl(UnitKind::Processing, payload),
            codes::SET_EXTENSION_PROPERTY => self.property_set_ioctl(UnitKind::Extension, payload),
            codes::GET_EXTENSION_PROPERTY => self.property_get_ioctl(UnitKind::Extension, payload),
            codes::START => self.start().map(|_| Vec::new()),
            codes::STOP => self.stop().map(|_| Vec::new()),
            other => Err(CaptureError::UnknownIoctl(other)),
        }
    }

    fn parse_property(payload: &[u8]) -> Result<UnitProperty> {
        UnitProperty::parse(payload).map_err(|err| match err {
            openstill_uvc_protocol::PropertyError::TooLarge(_) => CaptureError::NoMemory,
            other => CaptureError::invalid(other.to_string()),
        })
    }

    fn property_set_ioctl(&self, kind: UnitKind, payload: &[u8]) -> Result<Vec<u8>> {
        let prop = Self::parse_property(payload)?;
        self.set_property(kind, &prop).map(|_| Vec::new())
    }

    fn property_get_ioctl(&self, kind: UnitKind, payload: &[u8]) -> Result<Vec<u8>> {
        let prop = Self::parse_property(payload)?;
        self.get_property(kind, &prop)
    }

    // ── Termination ─────────────────────────────────────────────────

    /// Disconnect: set terminating, wake every sleeper, kill transfers,
    /// join the service threads, and free the pool.
    pub fn shutdown(&self) {
        if self.status.terminating() {
            return;
        }
        info!(id = self.id, "device disconnect");

        self.status.set_terminating();
        self.engine.wake_all();

        // Best effort: quiesce the stream before tearing down.
        let _ = self.plane.select_alt(0);
        self.engine.ring().kill_all(&*self.ctl, &self.pool);
        self.ctl.cancel_stream();

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }

        let freed = self.pool.drain();
        info!(
            id = self.id,
            packets = self.stats.packets(),
            packet_errors = self.stats.packet_errors(),
            bytes = self.stats.bytes_received(),
            buffers_freed = freed,
            "device shut down"
        );
    }
}

impl Drop for StillDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
