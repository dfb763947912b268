//! End-to-end engine tests against a scripted host controller.
//!
//! The mock plays the device side: it answers negotiation, stores unit
//! properties in a register file, and feeds scripted packet streams to
//! the transfer pump when the still trigger fires.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use openstill_engine::{
    codes, CaptureState, ControlSetup, DeviceDescription, EngineTuning, FrameSizeArg,
    HostController, PacketTable, StillDevice, UnitIds,
};
use openstill_errors::{CaptureError, TransportError, TransportResult};
use openstill_uvc_protocol::{
    header_flags, request, unity_selector, vs_selector, FrameSize, StillControl, UnitProperty,
    HEADER_LEN, UNITY_PRODUCT_ID, UNITY_VENDOR_ID,
};
use parking_lot::{Condvar, Mutex};

const MOCK_MAX_PAYLOAD: u32 = 3072;
const PAYLOAD_PER_PACKET: usize = MOCK_MAX_PAYLOAD as usize - HEADER_LEN;

/// One scripted transfer: the packets the endpoint returns for a single
/// completed request.
type Transfer = Vec<Vec<u8>>;

#[derive(Default)]
struct MockState {
    queue: VecDeque<Transfer>,
    cancelled: bool,
    /// Transfers released into the queue when the still trigger fires.
    on_trigger: Vec<Transfer>,
}

struct MockCamera {
    state: Mutex<MockState>,
    wakeup: Condvar,
    registers: Mutex<HashMap<(u8, u8), Vec<u8>>>,
    control_log: Mutex<Vec<(u8, u8, u8)>>,
    alt_log: Mutex<Vec<u8>>,
}

impl MockCamera {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            wakeup: Condvar::new(),
            registers: Mutex::new(HashMap::new()),
            control_log: Mutex::new(Vec::new()),
            alt_log: Mutex::new(Vec::new()),
        })
    }

    fn push_transfer(&self, transfer: Transfer) {
        self.state.lock().queue.push_back(transfer);
        self.wakeup.notify_all();
    }

    fn script_trigger(&self, transfers: Vec<Transfer>) {
        self.state.lock().on_trigger = transfers;
    }

    fn control_log(&self) -> Vec<(u8, u8, u8)> {
        self.control_log.lock().clone()
    }

    fn alt_log(&self) -> Vec<u8> {
        self.alt_log.lock().clone()
    }
}

impl HostController for MockCamera {
    fn control_out(&self, setup: &ControlSetup, data: &[u8]) -> TransportResult<()> {
        self.control_log
            .lock()
            .push((setup.request, setup.unit, setup.selector));

        if setup.unit == 0 {
            if setup.selector == vs_selector::STILL_IMAGE_TRIGGER_CONTROL {
                assert_eq!(data, &[1]);
                let mut state = self.state.lock();
                let transfers = std::mem::take(&mut state.on_trigger);
                state.queue.extend(transfers);
                drop(state);
                self.wakeup.notify_all();
            }
        } else {
            self.registers
                .lock()
                .insert((setup.unit, setup.selector), data.to_vec());
        }
        Ok(())
    }

    fn control_in(&self, setup: &ControlSetup, data: &mut [u8]) -> TransportResult<usize> {
        self.control_log
            .lock()
            .push((setup.request, setup.unit, setup.selector));

        if setup.unit == 0 {
            match setup.selector {
                vs_selector::STILL_PROBE_CONTROL | vs_selector::STILL_COMMIT_CONTROL => {
                    let reply = StillControl {
                        format_index: 1,
                        frame_index: 1,
                        compression_index: 1,
                        max_video_frame_size: 0xffff_ffff,
                        max_payload_transfer_size: MOCK_MAX_PAYLOAD,
                    }
                    .encode();
                    let n = reply.len().min(data.len());
                    data[..n].copy_from_slice(&reply[..n]);
                }
                _ => data.fill(0),
            }
        } else if let Some(value) = self
            .registers
            .lock()
            .get(&(setup.unit, setup.selector))
        {
            let n = value.len().min(data.len());
            data[..n].copy_from_slice(&value[..n]);
            data[n..].fill(0);
        } else {
            data.fill(0);
        }
        Ok(data.len())
    }

    fn set_alt_setting(&self, _interface: u8, alt: u8) -> TransportResult<()> {
        self.alt_log.lock().push(alt);
        Ok(())
    }

    fn stream_in(&self, buf: &mut [u8], table: &mut PacketTable) -> TransportResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return Err(TransportError::Shutdown);
            }
            if let Some(transfer) = state.queue.pop_front() {
                let mut offset = 0;
                for packet in &transfer {
                    assert!(
                        offset + packet.len() <= buf.len(),
                        "scripted transfer exceeds buffer"
                    );
                    buf[offset..offset + packet.len()].copy_from_slice(packet);
                    table.push(offset, packet.len(), true);
                    offset += packet.len();
                }
                return Ok(());
            }
            self.wakeup.wait(&mut state);
        }
    }

    fn cancel_stream(&self) {
        self.state.lock().cancelled = true;
        self.wakeup.notify_all();
    }

    fn resume_stream(&self) {
        self.state.lock().cancelled = false;
    }

    fn interrupt_in(&self, _buf: &mut [u8]) -> TransportResult<usize> {
        Err(TransportError::Unsupported("no status endpoint".into()))
    }
}

// ── Packet builders ─────────────────────────────────────────────────────────

fn packet(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0u8; HEADER_LEN];
    p[0] = HEADER_LEN as u8;
    p[1] = flags;
    p.extend_from_slice(payload);
    p
}

/// A complete video frame: a couple of preview packets, EOF on the last.
fn video_frame(fid: bool) -> Vec<Transfer> {
    let fid_bit = if fid { header_flags::FID } else { 0 };
    vec![
        vec![packet(fid_bit, &[0u8; 64])],
        vec![packet(fid_bit | header_flags::EOF, &[0u8; 64])],
    ]
}

/// A still frame split into single-packet transfers, EOF on the last.
fn still_frame(bytes: &[u8], fid: bool) -> Vec<Transfer> {
    let fid_bit = if fid { header_flags::FID } else { 0 };
    let chunks: Vec<&[u8]> = bytes.chunks(PAYLOAD_PER_PACKET).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let flags = header_flags::STI | fid_bit | if i == last { header_flags::EOF } else { 0 };
            vec![packet(flags, chunk)]
        })
        .collect()
}

// ── Fixtures ────────────────────────────────────────────────────────────────

fn catalogue() -> Vec<FrameSize> {
    vec![
        FrameSize {
            width: 640,
            height: 480,
        },
        FrameSize {
            width: 1280,
            height: 720,
        },
        FrameSize {
            width: 2592,
            height: 1944,
        },
    ]
}

fn description(vendor_id: u16, product_id: u16) -> DeviceDescription {
    DeviceDescription {
        vendor_id,
        product_id,
        control_interface: 0,
        streaming_interface: 1,
        endpoint_address: 0x82,
        status_endpoint: None,
        max_bandwidth_alt: 7,
        use_bulk: true,
        max_packet_size: 1024,
        units: UnitIds {
            camera_terminal: 2,
            processing_unit: 3,
            extension_unit: 4,
        },
        frame_sizes: catalogue(),
        initial_frame_index: 2,
    }
}

fn tuning() -> EngineTuning {
    EngineTuning {
        exclusive_access: false,
        initial_pool_buffers: 8,
        pool_buffer_limit: 32,
        frame_buf_pages: 512,
        ctrl_timeout: Duration::from_millis(50),
    }
}

fn probe(mock: &Arc<MockCamera>, vendor: u16, product: u16) -> Arc<StillDevice> {
    let ctl: Arc<dyn HostController> = Arc::clone(mock) as Arc<dyn HostController>;
    StillDevice::probe(ctl, description(vendor, product), tuning()).expect("probe")
}

fn wait_for_state(dev: &StillDevice, state: CaptureState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while dev.state() != state {
        assert!(Instant::now() < deadline, "timed out waiting for {state:?}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Feed two complete video frames so the trigger guard opens.
fn arm_trigger(mock: &Arc<MockCamera>, dev: &StillDevice) {
    for transfer in video_frame(false) {
        mock.push_transfer(transfer);
    }
    for transfer in video_frame(true) {
        mock.push_transfer(transfer);
    }
    wait_for_state(dev, CaptureState::Triggerable);
}

fn read_to_end(handle: &openstill_engine::CaptureHandle) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = handle.read(&mut chunk).expect("read");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn happy_path_1280x720() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    handle
        .ioctl(
            codes::SET_FRAME_SIZE,
            &FrameSizeArg {
                width: 1280,
                height: 720,
            }
            .encode(),
        )
        .expect("set frame size");

    let frame: Vec<u8> = (0..1280u32 * 720 * 2).map(|i| (i % 251) as u8).collect();
    mock.script_trigger(still_frame(&frame, false));
    arm_trigger(&mock, &dev);

    handle
        .ioctl(codes::TRIGGER_STILL_IMAGE, &[])
        .expect("trigger");

    let got = read_to_end(&handle);
    assert_eq!(got.len(), 1_843_200);
    assert_eq!(got, frame);

    // The frame was consumed; the device is ready for the next trigger.
    assert_eq!(dev.state(), CaptureState::Waiting);
    drop(handle);
    dev.shutdown();
}

#[test]
fn frame_size_not_in_catalogue_is_rejected() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    let err = handle
        .ioctl(
            codes::SET_FRAME_SIZE,
            &FrameSizeArg {
                width: 1000,
                height: 1000,
            }
            .encode(),
        )
        .expect_err("must reject");
    assert!(matches!(err, CaptureError::UnsupportedFrameSize { .. }));
    assert_eq!(err.errno(), -22);

    // Selection unchanged.
    let out = handle
        .ioctl(codes::GET_FRAME_SIZE, &[])
        .expect("get frame size");
    assert_eq!(
        FrameSizeArg::parse(&out),
        Some(FrameSizeArg {
            width: 2592,
            height: 1944,
        })
    );
    dev.shutdown();
}

#[test]
fn nonblocking_read_before_trigger() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(true).expect("open nonblocking");

    let mut buf = [0u8; 128];
    assert!(matches!(
        handle.read(&mut buf),
        Err(CaptureError::WouldBlock)
    ));
    dev.shutdown();
}

#[test]
fn detach_unblocks_trigger_and_poisons_reads() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    // No video frames were fed, so the trigger blocks.
    let trigger_dev = Arc::clone(&dev);
    let waiter = std::thread::spawn(move || trigger_dev.trigger_still());
    std::thread::sleep(Duration::from_millis(50));

    dev.shutdown();

    let result = waiter.join().expect("trigger thread");
    assert!(matches!(result, Err(CaptureError::DeviceGone)));

    let mut buf = [0u8; 16];
    assert!(matches!(
        handle.read(&mut buf),
        Err(CaptureError::DeviceGone)
    ));
}

#[test]
fn video_packet_mid_still_truncates_the_frame() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    // A still that never finishes: two data packets, then the preview
    // resumes without an end-of-frame.
    let partial: Vec<Transfer> = vec![
        vec![packet(header_flags::STI, &[7u8; 100])],
        vec![packet(header_flags::STI, &[7u8; 100])],
        vec![packet(0, &[0u8; 32])],
    ];
    mock.script_trigger(partial);
    arm_trigger(&mock, &dev);

    handle
        .ioctl(codes::TRIGGER_STILL_IMAGE, &[])
        .expect("trigger");

    wait_for_state(&dev, CaptureState::Error);

    // The partial bytes drain first, then the error is delivered.
    let mut sink = vec![0u8; 4096];
    let mut drained = 0;
    loop {
        match handle.read(&mut sink) {
            Ok(n) => {
                assert!(n > 0, "EOF must not precede the error");
                drained += n;
            }
            Err(err) => {
                assert!(matches!(err, CaptureError::Io(_)));
                assert_eq!(err.errno(), -5);
                break;
            }
        }
    }
    assert_eq!(drained, 200);

    // Consumed: back to Waiting, next read blocks again.
    assert_eq!(dev.state(), CaptureState::Waiting);
    dev.shutdown();
}

#[test]
fn extension_property_round_trip() {
    let mock = MockCamera::new();
    let dev = probe(&mock, UNITY_VENDOR_ID, UNITY_PRODUCT_ID);
    let handle = dev.open(false).expect("open");

    let set = UnitProperty {
        control_selector: unity_selector::SHUTTER_SPEED,
        request: request::SET_CUR,
        data: vec![17],
    };
    handle
        .ioctl(codes::SET_EXTENSION_PROPERTY, &set.encode().expect("fits"))
        .expect("set property");

    let get = UnitProperty {
        control_selector: unity_selector::SHUTTER_SPEED,
        request: request::GET_CUR,
        data: vec![0],
    };
    let out = handle
        .ioctl(codes::GET_EXTENSION_PROPERTY, &get.encode().expect("fits"))
        .expect("get property");
    assert_eq!(out, vec![17]);
    dev.shutdown();
}

#[test]
fn property_envelope_validation() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    // GET with a SET-only request code.
    let bad = UnitProperty {
        control_selector: 1,
        request: request::SET_CUR,
        data: vec![0],
    };
    assert!(matches!(
        handle.ioctl(codes::GET_CAMERA_PROPERTY, &bad.encode().expect("fits")),
        Err(CaptureError::InvalidArgument(_))
    ));

    // Envelope over the 64-byte cap.
    let mut oversized = Vec::new();
    oversized.extend_from_slice(&100u16.to_le_bytes());
    oversized.push(1);
    oversized.push(request::SET_CUR);
    oversized.extend_from_slice(&[0u8; 100]);
    assert!(matches!(
        handle.ioctl(codes::SET_PROCESSING_PROPERTY, &oversized),
        Err(CaptureError::NoMemory)
    ));
    dev.shutdown();
}

#[test]
fn unknown_ioctl_is_rejected() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");
    let err = handle.ioctl(9999, &[]).expect_err("unknown command");
    assert_eq!(err.errno(), -25);
    dev.shutdown();
}

#[test]
fn suspend_resume_restores_transfer_cardinality() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    assert_eq!(dev.active_transfers(), 8);
    handle.ioctl(codes::SUSPEND, &[]).expect("suspend");
    assert_eq!(dev.active_transfers(), 0);
    handle.ioctl(codes::RESUME, &[]).expect("resume");
    assert_eq!(dev.active_transfers(), 8);
    dev.shutdown();
}

#[test]
fn start_after_stop_reaches_waiting_on_max_alt() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    handle.ioctl(codes::STOP, &[]).expect("stop");
    assert_eq!(dev.active_transfers(), 0);
    assert_eq!(mock.alt_log().last(), Some(&0));

    handle.ioctl(codes::START, &[]).expect("start");
    assert_eq!(dev.state(), CaptureState::Waiting);
    assert_eq!(dev.active_transfers(), 8);
    assert_eq!(mock.alt_log().last(), Some(&7));
    dev.shutdown();
}

#[test]
fn unity_device_skips_commit_readback() {
    let mock = MockCamera::new();
    let dev = probe(&mock, UNITY_VENDOR_ID, UNITY_PRODUCT_ID);
    let log = mock.control_log();
    assert!(!log.contains(&(request::GET_CUR, 0, vs_selector::STILL_COMMIT_CONTROL)));
    dev.shutdown();

    // And a quirk-free device does verify the commit.
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let log = mock.control_log();
    assert!(log.contains(&(request::GET_CUR, 0, vs_selector::STILL_COMMIT_CONTROL)));
    dev.shutdown();
}

#[test]
fn second_trigger_after_consumed_frame() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    let first: Vec<u8> = vec![1u8; 5000];
    mock.script_trigger(still_frame(&first, false));
    arm_trigger(&mock, &dev);
    handle.ioctl(codes::TRIGGER_STILL_IMAGE, &[]).expect("trigger");
    assert_eq!(read_to_end(&handle).len(), 5000);

    // Arm again: two more video frames, opposite FID still.
    let second: Vec<u8> = vec![2u8; 7000];
    mock.script_trigger(still_frame(&second, true));
    arm_trigger(&mock, &dev);
    handle.ioctl(codes::TRIGGER_STILL_IMAGE, &[]).expect("trigger");
    let got = read_to_end(&handle);
    assert_eq!(got.len(), 7000);
    assert!(got.iter().all(|&b| b == 2));
    dev.shutdown();
}

#[test]
fn multi_packet_transfers_reassemble_in_order() {
    let mock = MockCamera::new();
    let mut desc = description(0x1d6b, 0x0102);
    desc.use_bulk = false;
    desc.max_packet_size = 1024;
    let ctl: Arc<dyn HostController> = Arc::clone(&mock) as Arc<dyn HostController>;
    let dev = StillDevice::probe(ctl, desc, tuning()).expect("probe");
    let handle = dev.open(false).expect("open");

    // Isochronous-style: several small packets per transfer.
    let frame: Vec<u8> = (0..6000u32).map(|i| (i % 241) as u8).collect();
    let chunks: Vec<&[u8]> = frame.chunks(1000).collect();
    let last = chunks.len() - 1;
    let mut transfers: Vec<Transfer> = Vec::new();
    for (group_idx, group) in chunks.chunks(3).enumerate() {
        let mut transfer = Transfer::new();
        for (i, chunk) in group.iter().enumerate() {
            let overall = group_idx * 3 + i;
            let flags =
                header_flags::STI | if overall == last { header_flags::EOF } else { 0 };
            transfer.push(packet(flags, chunk));
        }
        transfers.push(transfer);
    }
    mock.script_trigger(transfers);
    arm_trigger(&mock, &dev);

    handle.ioctl(codes::TRIGGER_STILL_IMAGE, &[]).expect("trigger");
    let got = read_to_end(&handle);
    assert_eq!(got, frame);
    dev.shutdown();
}

#[test]
fn exclusive_access_rejects_second_open() {
    let mock = MockCamera::new();
    let mut exclusive = tuning();
    exclusive.exclusive_access = true;
    let ctl: Arc<dyn HostController> = Arc::clone(&mock) as Arc<dyn HostController>;
    let dev = StillDevice::probe(ctl, description(0x1d6b, 0x0102), exclusive).expect("probe");

    let first = dev.open(false).expect("first open");
    assert!(matches!(dev.open(false), Err(CaptureError::Busy)));
    drop(first);
    let _second = dev.open(false).expect("open after release");
    dev.shutdown();
}

#[test]
fn release_resets_stale_state() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    let frame = vec![9u8; 3000];
    mock.script_trigger(still_frame(&frame, false));
    arm_trigger(&mock, &dev);
    handle.ioctl(codes::TRIGGER_STILL_IMAGE, &[]).expect("trigger");
    wait_for_state(&dev, CaptureState::Success);

    // Close without reading; the stale Success must not leak into the
    // next session.
    drop(handle);
    assert_eq!(dev.state(), CaptureState::Waiting);

    // The next session may drain the leftover bytes, but must never see
    // the prior session's end-of-frame: after the data runs out it
    // would-block instead of returning a clean EOF.
    let handle = dev.open(true).expect("reopen");
    let mut drained = 0;
    let mut buf = [0u8; 1024];
    loop {
        match handle.read(&mut buf) {
            Ok(n) => {
                assert!(n > 0, "stale Success must not surface as EOF");
                drained += n;
            }
            Err(err) => {
                assert!(matches!(err, CaptureError::WouldBlock));
                break;
            }
        }
    }
    assert_eq!(drained, 3000);
    dev.shutdown();
}

#[test]
fn interrupted_read_returns_restartsys() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");
    let interrupter = handle.interrupter();

    let reader = std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        handle.read(&mut buf)
    });
    std::thread::sleep(Duration::from_millis(50));
    interrupter.interrupt();

    let err = reader
        .join()
        .expect("reader thread")
        .expect_err("interrupted");
    assert!(matches!(err, CaptureError::Interrupted));
    assert_eq!(err.errno(), -512);
    dev.shutdown();
}

#[test]
fn stats_track_frame_bytes() {
    let mock = MockCamera::new();
    let dev = probe(&mock, 0x1d6b, 0x0102);
    let handle = dev.open(false).expect("open");

    let frame = vec![5u8; 10_000];
    mock.script_trigger(still_frame(&frame, false));
    arm_trigger(&mock, &dev);
    handle.ioctl(codes::TRIGGER_STILL_IMAGE, &[]).expect("trigger");
    let got = read_to_end(&handle);
    assert_eq!(got.len(), 10_000);
    assert_eq!(dev.stats().bytes_received(), 10_000);
    assert!(dev.stats().packets() > 0);
    dev.shutdown();
}
