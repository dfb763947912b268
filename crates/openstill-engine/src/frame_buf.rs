//! Frame reassembly buffer.
//!
//! A paged byte queue bridging the worker (producer) and readers
//! (consumer). `head` is the next byte offset to write, `tail` the next
//! to read; `head - tail` is the unread count and `tail <= head` always
//! holds. Both indices reset to zero when a new still frame starts.
//!
//! The store lock is held only for one packet on the write side and for
//! at most one page's worth of copying on the read side, so neither side
//! can starve the other. Serialization of concurrent readers is the
//! caller's job (the device holds a read mutex across a whole `read`).

use parking_lot::Mutex;
use tracing::warn;

/// Bytes per page.
pub const FRAME_BUF_PAGE_SIZE: usize = 4 * 1024;

/// Pages per device.
pub const FRAME_BUF_NUM_PAGES: usize = 6400;

#[derive(Debug)]
struct Store {
    pages: Vec<Box<[u8]>>,
    head: usize,
    tail: usize,
    /// Set once per frame when the buffer fills, to keep the overflow
    /// warning from repeating for every packet.
    overflowed: bool,
}

/// Paged single-producer byte queue for one still frame.
#[derive(Debug)]
pub struct FrameBuffer {
    store: Mutex<Store>,
    capacity: usize,
}

impl FrameBuffer {
    /// A buffer with the standard page count.
    pub fn new() -> Self {
        Self::with_pages(FRAME_BUF_NUM_PAGES)
    }

    /// A buffer with a custom page count. Capacity is
    /// `pages * FRAME_BUF_PAGE_SIZE` bytes.
    pub fn with_pages(pages: usize) -> Self {
        let pages: Vec<Box<[u8]>> = (0..pages)
            .map(|_| vec![0u8; FRAME_BUF_PAGE_SIZE].into_boxed_slice())
            .collect();
        let capacity = pages.len() * FRAME_BUF_PAGE_SIZE;
        Self {
            store: Mutex::new(Store {
                pages,
                head: 0,
                tail: 0,
                overflowed: false,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reset both indices for a new frame.
    pub fn reset(&self) {
        let mut store = self.store.lock();
        store.head = 0;
        store.tail = 0;
        store.overflowed = false;
    }

    /// Unread bytes.
    pub fn available(&self) -> usize {
        let store = self.store.lock();
        store.head - store.tail
    }

    /// Byte offsets, for diagnostics.
    pub fn offsets(&self) -> (usize, usize) {
        let store = self.store.lock();
        (store.head, store.tail)
    }

    /// Append payload bytes at `head`, splitting copies at page
    /// boundaries. Bytes past capacity are dropped.
    ///
    /// Returns the number of bytes actually stored.
    pub fn append(&self, mut bytes: &[u8]) -> usize {
        let mut store = self.store.lock();
        let mut written = 0;

        while !bytes.is_empty() {
            let page = store.head / FRAME_BUF_PAGE_SIZE;
            if page >= store.pages.len() {
                if !store.overflowed {
                    store.overflowed = true;
                    warn!(head = store.head, "frame buffer out of space, dropping bytes");
                }
                break;
            }
            let offset = store.head % FRAME_BUF_PAGE_SIZE;
            let take = bytes.len().min(FRAME_BUF_PAGE_SIZE - offset);
            store.pages[page][offset..offset + take].copy_from_slice(&bytes[..take]);
            store.head += take;
            written += take;
            bytes = &bytes[take..];
        }

        written
    }

    /// Copy unread bytes into `out`, advancing `tail`.
    ///
    /// At most one page's remainder is copied per call; callers loop
    /// until this returns 0.
    pub fn read_chunk(&self, out: &mut [u8]) -> usize {
        let mut store = self.store.lock();
        let page = store.tail / FRAME_BUF_PAGE_SIZE;
        let offset = store.tail % FRAME_BUF_PAGE_SIZE;
        let avail = (store.head - store.tail)
            .min(FRAME_BUF_PAGE_SIZE - offset)
            .min(out.len());
        if avail == 0 {
            return 0;
        }
        out[..avail].copy_from_slice(&store.pages[page][offset..offset + avail]);
        store.tail += avail;
        avail
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
