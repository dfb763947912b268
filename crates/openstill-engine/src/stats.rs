//! Capture statistics.
//!
//! Updated from the pump and worker with relaxed atomics; read for
//! logging at end-of-frame and at disconnect.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CaptureStats {
    /// Packets seen since bring-up.
    packets: AtomicU64,
    /// Packets that completed with an error status.
    packet_errors: AtomicU64,
    /// Still payload bytes stored.
    bytes_received: AtomicU64,
    /// Per-frame counters, reset when a still starts.
    frame_video_packets: AtomicU64,
    frame_still_packets: AtomicU64,
    frame_allocs: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_packet_error(&self) {
        self.packet_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_bytes(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn count_video_packet(&self) {
        self.frame_video_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_still_packet(&self) {
        self.frame_still_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_alloc(&self) {
        self.frame_allocs.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the per-frame counters at the start of a still.
    pub fn reset_frame(&self) {
        self.frame_video_packets.store(0, Ordering::Relaxed);
        self.frame_still_packets.store(0, Ordering::Relaxed);
        self.frame_allocs.store(0, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn packet_errors(&self) -> u64 {
        self.packet_errors.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn frame_summary(&self) -> (u64, u64, u64) {
        (
            self.frame_still_packets.load(Ordering::Relaxed),
            self.frame_video_packets.load(Ordering::Relaxed),
            self.frame_allocs.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reset_leaves_totals() {
        let stats = CaptureStats::new();
        stats.count_packet();
        stats.count_bytes(128);
        stats.count_still_packet();
        stats.count_video_packet();
        stats.reset_frame();
        assert_eq!(stats.packets(), 1);
        assert_eq!(stats.bytes_received(), 128);
        assert_eq!(stats.frame_summary(), (0, 0, 0));
    }
}
