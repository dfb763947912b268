//! Transfer ring, completion pump, and the deferred worker.
//!
//! The ring keeps [`NUM_TRANSFER_REQUESTS`] transfers outstanding so the
//! host controller never starves. The pump services completions: it
//! snapshots the packet table into the pool buffer, queues it for the
//! worker, and eagerly requeues the transfer with a replacement buffer.
//! Requeueing is done here rather than in the worker because the free
//! buffer supply drains faster than a deferred path can refill the
//! controller's queue; the worker does only the comparatively expensive
//! demultiplex and copy.
//!
//! Completions may still arrive after a kill; they find their slot
//! inactive and quietly return the buffer to the pool.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::capture::CapturePipeline;
use crate::controller::{HostController, PacketTable};
use crate::pool::{BufferPool, PoolBuffer};
use crate::stats::CaptureStats;
use crate::status::StatusCell;

/// Concurrently outstanding transfer requests per device.
pub const NUM_TRANSFER_REQUESTS: usize = 8;

/// One transfer request: whether it is submitted, and the pool buffer it
/// currently owns. An inactive request never holds a buffer.
#[derive(Debug, Default)]
struct Slot {
    active: bool,
    buffer: Option<PoolBuffer>,
}

/// The ring of transfer requests.
#[derive(Debug)]
pub struct TransferRing {
    slots: Mutex<Vec<Slot>>,
    active: AtomicBool,
    gate: Condvar,
}

impl TransferRing {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NUM_TRANSFER_REQUESTS);
        slots.resize_with(NUM_TRANSFER_REQUESTS, Slot::default);
        Self {
            slots: Mutex::new(slots),
            active: AtomicBool::new(false),
            gate: Condvar::new(),
        }
    }

    /// Whether the ring is submitted to the controller.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of slots currently holding a submission.
    pub fn active_slots(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.active).count()
    }

    /// Attach buffers and mark every idle slot submitted. A slot whose
    /// buffer cannot be acquired stays inactive; the rest proceed.
    pub fn submit_all(&self, pool: &BufferPool) -> usize {
        if self.active.swap(true, Ordering::AcqRel) {
            // Already submitted.
            return self.active_slots();
        }
        debug!("submitting transfers");

        // Buffers are acquired before the ring lock is taken; growth
        // allocation must never happen under it.
        let mut spare = Vec::with_capacity(NUM_TRANSFER_REQUESTS);
        for _ in 0..NUM_TRANSFER_REQUESTS {
            match pool.acquire() {
                Some(buf) => spare.push(buf),
                None => break,
            }
        }

        let mut count = 0;
        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut() {
                if slot.active {
                    count += 1;
                    continue;
                }
                match spare.pop() {
                    Some(buf) => {
                        slot.buffer = Some(buf);
                        slot.active = true;
                        count += 1;
                    }
                    None => warn!("no transfer buffer available, leaving request idle"),
                }
            }
        }
        for leftover in spare {
            pool.recycle(leftover);
        }
        self.gate.notify_all();
        count
    }

    /// Cancel every outstanding transfer and return their buffers.
    pub fn kill_all(&self, ctl: &dyn HostController, pool: &BufferPool) {
        if !self.active.swap(false, Ordering::AcqRel) {
            // Already killed.
            return;
        }
        debug!("killing transfers");
        ctl.cancel_stream();

        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.active = false;
            if let Some(buf) = slot.buffer.take() {
                pool.recycle(buf);
            }
        }
    }

    /// Wake a pump parked on an inactive ring.
    pub fn wake(&self) {
        self.gate.notify_all();
    }

    fn take_lease(&self, idx: usize) -> Lease {
        let mut slots = self.slots.lock();
        let slot = &mut slots[idx];
        if !slot.active {
            return Lease::Inactive;
        }
        match slot.buffer.take() {
            Some(buf) => Lease::Ready(buf),
            None => Lease::NeedsBuffer,
        }
    }

    /// Give a buffer back to an active slot; recycles it if the slot was
    /// deactivated in the meantime.
    fn store_buffer(&self, idx: usize, buf: PoolBuffer, pool: &BufferPool) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[idx];
        if slot.active {
            slot.buffer = Some(buf);
        } else {
            drop(slots);
            pool.recycle(buf);
        }
    }

    fn deactivate(&self, idx: usize) {
        self.slots.lock()[idx].active = false;
    }

    fn park_while_inactive(&self, status: &StatusCell) {
        let mut slots = self.slots.lock();
        while !self.active.load(Ordering::Acquire) && !status.terminating() {
            self.gate.wait(&mut slots);
        }
    }
}

impl Default for TransferRing {
    fn default() -> Self {
        Self::new()
    }
}

enum Lease {
    Inactive,
    Ready(PoolBuffer),
    NeedsBuffer,
}

/// Wakeup channel between the pump and the worker.
#[derive(Debug, Default)]
struct WorkerGate {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl WorkerGate {
    fn notify(&self) {
        *self.pending.lock() = true;
        self.cv.notify_one();
    }

    /// Block until notified or terminating.
    fn wait(&self, status: &StatusCell) {
        let mut pending = self.pending.lock();
        while !*pending && !status.terminating() {
            self.cv.wait(&mut pending);
        }
        *pending = false;
    }
}

/// The streaming side of one device: ring plus the two service loops.
#[derive(Debug)]
pub struct StreamEngine {
    ring: TransferRing,
    worker_gate: WorkerGate,
    alive: AtomicBool,
}

impl StreamEngine {
    pub fn new() -> Self {
        Self {
            ring: TransferRing::new(),
            worker_gate: WorkerGate::default(),
            alive: AtomicBool::new(false),
        }
    }

    pub fn ring(&self) -> &TransferRing {
        &self.ring
    }

    /// Drain both service loops at termination.
    pub fn wake_all(&self) {
        self.ring.wake();
        self.worker_gate.notify();
    }

    /// Completion loop. Runs until termination; parks while the ring is
    /// killed. May touch only the pool and the short ring lock.
    pub fn run_pump(
        &self,
        ctl: &dyn HostController,
        pool: &BufferPool,
        status: &StatusCell,
        stats: &CaptureStats,
    ) {
        let mut table = PacketTable::default();
        let mut idx = 0;

        while !status.terminating() {
            if !self.ring.is_active() {
                self.ring.park_while_inactive(status);
                continue;
            }

            let mut buf = match self.ring.take_lease(idx) {
                Lease::Ready(buf) => buf,
                Lease::NeedsBuffer => {
                    // Allocation outside the ring lock.
                    if pool.free_len() == 0 {
                        stats.count_alloc();
                    }
                    match pool.acquire() {
                        Some(buf) => buf,
                        None => {
                            warn!("transfer buffer pool exhausted, request left idle");
                            self.ring.deactivate(idx);
                            idx = (idx + 1) % NUM_TRANSFER_REQUESTS;
                            continue;
                        }
                    }
                }
                Lease::Inactive => {
                    idx = (idx + 1) % NUM_TRANSFER_REQUESTS;
                    continue;
                }
            };

            table.clear();
            match ctl.stream_in(buf.data_mut(), &mut table) {
                Ok(()) => {
                    if !self.alive.swap(true, Ordering::Relaxed) {
                        info!("device is alive");
                    }
                    buf.set_packets(&table);
                    pool.queue_full(buf);
                    self.worker_gate.notify();

                    // Eager requeue: grab a replacement now so the
                    // controller queue never runs dry.
                    if pool.free_len() == 0 {
                        stats.count_alloc();
                    }
                    match pool.acquire() {
                        Some(replacement) => self.ring.store_buffer(idx, replacement, pool),
                        None => {
                            warn!("transfer buffer pool exhausted, request left idle");
                            self.ring.deactivate(idx);
                        }
                    }
                }
                Err(err) if err.is_fatal() || status.terminating() || !self.ring.is_active() => {
                    pool.recycle(buf);
                    self.ring.deactivate(idx);
                }
                Err(err) => {
                    // Transient: count it and resubmit with the same
                    // buffer, skipping processing.
                    stats.count_packet_error();
                    debug!(error = %err, "transfer error");
                    self.ring.store_buffer(idx, buf, pool);
                }
            }

            idx = (idx + 1) % NUM_TRANSFER_REQUESTS;
        }
    }

    /// Deferred worker loop: demultiplex and copy completed buffers.
    pub fn run_worker(&self, pool: &BufferPool, pipeline: &CapturePipeline, status: &StatusCell) {
        loop {
            while let Some(buf) = pool.take_full() {
                if !status.terminating() {
                    for payload in buf.packet_payloads() {
                        pipeline.handle_packet(payload);
                    }
                }
                pool.recycle(buf);
            }
            if status.terminating() {
                break;
            }
            self.worker_gate.wait(status);
        }
    }
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}
