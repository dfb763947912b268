//! Transfer-buffer pool.
//!
//! A fixed population of reusable buffers moves between two bounded
//! lock-free queues: *free* (awaiting a transfer request) and *full*
//! (carrying completed packets, awaiting the worker). A buffer is always
//! in exactly one place: the free queue, the full queue, leased to a
//! transfer request, or held by the worker.
//!
//! Buffers are preallocated at device bring-up and grown on demand up to
//! a hard cap; the population only shrinks at teardown.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use tracing::debug;

use crate::controller::{PacketTable, MAX_PACKETS_PER_TRANSFER};

/// Buffers preallocated per device.
pub const NUM_INITIAL_POOL_BUFFERS: usize = 1600;

/// Hard cap on the buffer population per device.
pub const POOL_BUFFER_LIMIT: usize = 3000;

/// One reusable transfer buffer plus a snapshot of its packet layout.
#[derive(Debug)]
pub struct PoolBuffer {
    data: Box<[u8]>,
    packets: [Option<(usize, usize)>; MAX_PACKETS_PER_TRANSFER],
    packet_count: usize,
}

impl PoolBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
            packets: [None; MAX_PACKETS_PER_TRANSFER],
            packet_count: 0,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Snapshot the completion's packet table. Erroneous packets are
    /// recorded as `None` so the worker skips them.
    pub fn set_packets(&mut self, table: &PacketTable) {
        self.packet_count = table.len();
        for (slot, entry) in self.packets.iter_mut().zip(table.entries()) {
            *slot = if entry.ok {
                Some((entry.offset, entry.len))
            } else {
                None
            };
        }
    }

    /// Payload slices of the good packets, in capture order.
    pub fn packet_payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.packets[..self.packet_count]
            .iter()
            .filter_map(move |slot| {
                slot.and_then(|(offset, len)| self.data.get(offset..offset + len))
            })
    }

    pub fn packet_count(&self) -> usize {
        self.packet_count
    }
}

/// The per-device buffer pool.
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<PoolBuffer>,
    full: ArrayQueue<PoolBuffer>,
    allocated: AtomicUsize,
    buf_len: usize,
    limit: usize,
}

impl BufferPool {
    /// Create a pool of `initial` buffers of `buf_len` bytes each,
    /// growable to `limit`.
    pub fn new(buf_len: usize, initial: usize, limit: usize) -> Self {
        let initial = initial.min(limit);
        let pool = Self {
            free: ArrayQueue::new(limit),
            full: ArrayQueue::new(limit),
            allocated: AtomicUsize::new(0),
            buf_len,
            limit,
        };
        for _ in 0..initial {
            if let Some(buf) = pool.allocate() {
                let _ = pool.free.push(buf);
            }
        }
        debug!(buffers = initial, bytes_each = buf_len, "buffer pool ready");
        pool
    }

    fn allocate(&self) -> Option<PoolBuffer> {
        // Reserve a population slot before paying for the allocation.
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.allocated.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(PoolBuffer::new(self.buf_len)),
                Err(observed) => current = observed,
            }
        }
    }

    /// Take a buffer for a transfer request: reuse a free one, else grow
    /// the population. `None` when the hard cap is reached.
    pub fn acquire(&self) -> Option<PoolBuffer> {
        self.free.pop().or_else(|| self.allocate())
    }

    /// Return a consumed buffer to the free queue.
    pub fn recycle(&self, buf: PoolBuffer) {
        if self.free.push(buf).is_err() {
            // Queue sized to the cap, so this is unreachable unless a
            // foreign buffer was handed in; shrink the count and drop.
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Hand a completed buffer to the worker.
    pub fn queue_full(&self, buf: PoolBuffer) {
        if self.full.push(buf).is_err() {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Next completed buffer, if any.
    pub fn take_full(&self) -> Option<PoolBuffer> {
        self.full.pop()
    }

    /// Drop every queued buffer. Called at teardown only.
    pub fn drain(&self) -> usize {
        let mut freed = 0;
        while self.free.pop().is_some() || self.full.pop().is_some() {
            freed += 1;
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
        freed
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn full_len(&self) -> usize {
        self.full.len()
    }
}
