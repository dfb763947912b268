//! Per-packet capture pipeline.
//!
//! Runs on the deferred worker, one packet at a time, so packet handling
//! needs no internal ordering beyond the state-machine lock. A packet is
//! classified by its payload header, admitted or dropped by the state
//! machine, copied into the frame buffer, and finalized when it closes
//! the frame.

use std::sync::Arc;

use openstill_uvc_protocol::{split_packet, PayloadFlags};
use tracing::{debug, warn};

use crate::frame_buf::FrameBuffer;
use crate::stats::CaptureStats;
use crate::status::{CaptureState, StatusCell};

/// The demultiplex/copy stage between pool buffers and the frame buffer.
#[derive(Debug)]
pub struct CapturePipeline {
    status: Arc<StatusCell>,
    frame: Arc<FrameBuffer>,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    pub fn new(status: Arc<StatusCell>, frame: Arc<FrameBuffer>, stats: Arc<CaptureStats>) -> Self {
        Self {
            status,
            frame,
            stats,
        }
    }

    /// Process one packet from the streaming endpoint, header included.
    pub fn handle_packet(&self, packet: &[u8]) {
        self.stats.count_packet();

        let Some((flags, payload)) = split_packet(packet) else {
            // Runt or malformed header; nothing to do.
            return;
        };

        if !self.admit(flags) {
            return;
        }

        let stored = self.frame.append(payload);
        self.stats.count_bytes(stored);

        self.finalize(flags);
        self.status.wake_readers();
    }

    /// Pre-write: classify and update the state machine. Returns whether
    /// the payload may be written.
    fn admit(&self, flags: PayloadFlags) -> bool {
        if flags.still_image() {
            self.stats.count_still_packet();

            if self.status.state() == CaptureState::InProgress {
                return true;
            }
            if self
                .status
                .transition_if(CaptureState::Waiting, CaptureState::InProgress)
                || self
                    .status
                    .transition_if(CaptureState::Triggerable, CaptureState::InProgress)
            {
                debug!("still image start");
                self.stats.reset_frame();
                self.status.latch_fid(flags.frame_id());
                self.frame.reset();
                return true;
            }

            // A still while a finished result is still pending; the
            // reader has not consumed it yet, so this one is dropped.
            warn!(state = ?self.status.state(), "unexpected still packet");
            false
        } else {
            self.stats.count_video_packet();

            if self.status.on_video_packet(flags.end_of_frame())
                && self
                    .status
                    .transition_if(CaptureState::Waiting, CaptureState::Triggerable)
            {
                debug!("ready to trigger");
                self.status.wake_trigger();
            }

            if self
                .status
                .transition_if(CaptureState::InProgress, CaptureState::Error)
            {
                // The still stream died without an end-of-frame.
                let (head, _) = self.frame.offsets();
                warn!(bytes = head, "still interrupted by video packet");
                self.status.wake_readers();
            }

            false
        }
    }

    /// Post-write: close the frame on EOF or on a FID toggle.
    fn finalize(&self, flags: PayloadFlags) {
        let toggled = self.status.fid_toggled(flags.frame_id());
        if !flags.end_of_frame() && !toggled {
            return;
        }
        if toggled && !flags.end_of_frame() {
            warn!("fid toggle without eof, closing frame");
        }

        let (head, _) = self.frame.offsets();
        let (still, video, allocs) = self.stats.frame_summary();
        debug!(
            bytes = head,
            still_packets = still,
            video_packets = video,
            allocs,
            "end of still frame"
        );

        self.status.finalize_frame();
        self.status.wake_trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openstill_uvc_protocol::{header_flags, HEADER_LEN};

    fn pipeline() -> CapturePipeline {
        CapturePipeline::new(
            Arc::new(StatusCell::new()),
            Arc::new(FrameBuffer::with_pages(4)),
            Arc::new(CaptureStats::new()),
        )
    }

    fn packet(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; HEADER_LEN];
        p[0] = HEADER_LEN as u8;
        p[1] = flags;
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn video_packets_are_discarded() {
        let p = pipeline();
        p.handle_packet(&packet(0, &[1, 2, 3]));
        assert_eq!(p.frame.available(), 0);
        assert_eq!(p.status.state(), CaptureState::Waiting);
    }

    #[test]
    fn two_video_frames_arm_the_trigger() {
        let p = pipeline();
        p.handle_packet(&packet(header_flags::EOF, &[]));
        assert_eq!(p.status.state(), CaptureState::Waiting);
        p.handle_packet(&packet(header_flags::EOF | header_flags::FID, &[]));
        assert_eq!(p.status.state(), CaptureState::Triggerable);
    }

    #[test]
    fn still_start_resets_frame_buffer() {
        let p = pipeline();
        p.frame.append(&[9; 100]);
        p.status.force(CaptureState::Triggerable);
        p.handle_packet(&packet(header_flags::STI, &[1, 2, 3, 4]));
        assert_eq!(p.status.state(), CaptureState::InProgress);
        assert_eq!(p.frame.available(), 4);
    }

    #[test]
    fn eof_without_reader_returns_to_waiting() {
        let p = pipeline();
        p.status.force(CaptureState::Triggerable);
        p.handle_packet(&packet(header_flags::STI, &[1, 2]));
        p.handle_packet(&packet(header_flags::STI | header_flags::EOF, &[3]));
        assert_eq!(p.status.state(), CaptureState::Waiting);
        assert_eq!(p.frame.available(), 3);
    }

    #[test]
    fn eof_with_reader_is_success() {
        let p = pipeline();
        p.status.try_set_busy(false);
        p.status.force(CaptureState::Triggerable);
        p.handle_packet(&packet(header_flags::STI, &[1, 2]));
        p.handle_packet(&packet(header_flags::STI | header_flags::EOF, &[3]));
        assert_eq!(p.status.state(), CaptureState::Success);
    }

    #[test]
    fn fid_toggle_closes_the_frame() {
        let p = pipeline();
        p.status.try_set_busy(false);
        p.status.force(CaptureState::Triggerable);
        p.handle_packet(&packet(header_flags::STI, &[1, 2]));
        // Next frame's FID without an EOF on the last packet.
        p.handle_packet(&packet(header_flags::STI | header_flags::FID, &[]));
        assert_eq!(p.status.state(), CaptureState::Success);
    }

    #[test]
    fn video_mid_still_is_an_error() {
        let p = pipeline();
        p.status.try_set_busy(false);
        p.status.force(CaptureState::Triggerable);
        p.handle_packet(&packet(header_flags::STI, &[1, 2]));
        p.handle_packet(&packet(0, &[9, 9]));
        assert_eq!(p.status.state(), CaptureState::Error);
        // The stray video bytes were not stored.
        assert_eq!(p.frame.available(), 2);
    }

    #[test]
    fn header_only_still_carries_eof() {
        let p = pipeline();
        p.status.try_set_busy(false);
        p.status.force(CaptureState::Triggerable);
        p.handle_packet(&packet(header_flags::STI, &[1, 2]));
        p.handle_packet(&packet(header_flags::STI | header_flags::EOF, &[]));
        assert_eq!(p.status.state(), CaptureState::Success);
        assert_eq!(p.frame.available(), 2);
    }

    #[test]
    fn still_during_pending_result_is_dropped() {
        let p = pipeline();
        p.status.try_set_busy(false);
        p.status.force(CaptureState::Success);
        p.handle_packet(&packet(header_flags::STI, &[5, 5]));
        assert_eq!(p.status.state(), CaptureState::Success);
        assert_eq!(p.frame.available(), 0);
    }
}
