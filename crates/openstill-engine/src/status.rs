//! Capture state machine and wait sets.
//!
//! Five states track one still capture end to end:
//!
//! ```text
//! Waiting ──(2nd video EOF since reset)──▶ Triggerable
//! Waiting | Triggerable ──(first still packet)──▶ InProgress
//! InProgress ──(EOF or FID toggle)──▶ Success (if open) else Waiting
//! InProgress ──(video packet)──▶ Error
//! Success ──(reader consumes EOF)──▶ Waiting
//! Error ──(reader consumes the error)──▶ Waiting
//! any ──(close)──▶ Waiting
//! ```
//!
//! All state is under one short mutex. The two condition variables are
//! the reader wait set and the trigger wait set; both are also signaled
//! on termination so every sleeper drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Capture progress for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Nothing captured and not yet safe to trigger.
    Waiting,
    /// Video is flowing; a trigger will be honored.
    Triggerable,
    /// Still data is arriving.
    InProgress,
    /// The still was interrupted; the next reader collects the error.
    Error,
    /// A complete still awaits its reader.
    Success,
}

#[derive(Debug)]
struct Inner {
    state: CaptureState,
    busy: bool,
    streaming: bool,
    /// Complete video frames observed since the last alternate-setting
    /// change. The device ignores triggers issued before it has emitted
    /// a couple of frames, so Waiting -> Triggerable is gated on 2.
    video_frames_since_reset: u32,
    /// FID bit latched at the first packet of the current still.
    frame_fid: bool,
}

/// Shared capture status: state machine, busy flag, and wait sets.
#[derive(Debug)]
pub struct StatusCell {
    inner: Mutex<Inner>,
    readers: Condvar,
    trigger: Condvar,
    terminating: AtomicBool,
}

/// Video frames that must complete before a trigger is allowed.
const VIDEO_FRAMES_BEFORE_TRIGGER: u32 = 2;

impl StatusCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CaptureState::Waiting,
                busy: false,
                streaming: false,
                video_frames_since_reset: 0,
                frame_fid: false,
            }),
            readers: Condvar::new(),
            trigger: Condvar::new(),
            terminating: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.inner.lock().state
    }

    /// Compare-and-set transition. Returns whether it fired.
    pub fn transition_if(&self, from: CaptureState, to: CaptureState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == from {
            inner.state = to;
            true
        } else {
            false
        }
    }

    /// Unconditional transition.
    pub fn force(&self, to: CaptureState) {
        self.inner.lock().state = to;
    }

    // ── Busy flag ───────────────────────────────────────────────────

    /// Mark the device open. With `exclusive`, a second open fails.
    pub fn try_set_busy(&self, exclusive: bool) -> bool {
        let mut inner = self.inner.lock();
        if exclusive && inner.busy {
            return false;
        }
        inner.busy = true;
        true
    }

    /// Close: clear busy and reset the state so a stale result cannot
    /// poison the next session.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.busy = false;
        inner.state = CaptureState::Waiting;
    }

    pub fn busy(&self) -> bool {
        self.inner.lock().busy
    }

    // ── Streaming flag ──────────────────────────────────────────────

    pub fn set_streaming(&self, on: bool) {
        self.inner.lock().streaming = on;
    }

    pub fn streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    // ── Video-frame trigger guard ───────────────────────────────────

    /// Record a video packet. Returns whether enough complete video
    /// frames have passed for a trigger to be honored.
    pub fn on_video_packet(&self, end_of_frame: bool) -> bool {
        let mut inner = self.inner.lock();
        if end_of_frame {
            inner.video_frames_since_reset = inner.video_frames_since_reset.saturating_add(1);
        }
        inner.video_frames_since_reset >= VIDEO_FRAMES_BEFORE_TRIGGER
    }

    /// Restart the frame count after an alternate-setting change.
    pub fn reset_video_frame_count(&self) {
        self.inner.lock().video_frames_since_reset = 0;
    }

    // ── Frame FID latch ─────────────────────────────────────────────

    /// Latch the FID bit of the first packet of a new still.
    pub fn latch_fid(&self, fid: bool) {
        self.inner.lock().frame_fid = fid;
    }

    /// Whether `fid` differs from the latched frame FID.
    pub fn fid_toggled(&self, fid: bool) -> bool {
        self.inner.lock().frame_fid != fid
    }

    /// End-of-frame: a finished still is handed to the reader only if
    /// somebody holds the device open; otherwise it is discarded.
    pub fn finalize_frame(&self) -> CaptureState {
        let mut inner = self.inner.lock();
        if inner.state == CaptureState::InProgress {
            inner.state = if inner.busy {
                CaptureState::Success
            } else {
                CaptureState::Waiting
            };
        }
        inner.state
    }

    // ── Termination ─────────────────────────────────────────────────

    pub fn terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Set the terminating flag and drain every wait set.
    pub fn set_terminating(&self) {
        self.terminating.store(true, Ordering::Release);
        let _inner = self.inner.lock();
        self.readers.notify_all();
        self.trigger.notify_all();
    }

    // ── Wait sets ───────────────────────────────────────────────────

    /// Wake blocked readers. Called after every frame-buffer append and
    /// on every transition a reader cares about.
    pub fn wake_readers(&self) {
        let _inner = self.inner.lock();
        self.readers.notify_all();
    }

    /// Wake a blocked trigger call.
    pub fn wake_trigger(&self) {
        let _inner = self.inner.lock();
        self.trigger.notify_all();
    }

    /// Block until there is something for a reader: data (per
    /// `has_data`), a finished or failed capture, interruption, or
    /// termination.
    pub fn wait_read_event(&self, has_data: impl Fn() -> bool, interrupted: impl Fn() -> bool) {
        let mut inner = self.inner.lock();
        loop {
            if self.terminating()
                || matches!(inner.state, CaptureState::Success | CaptureState::Error)
                || has_data()
                || interrupted()
            {
                return;
            }
            self.readers.wait(&mut inner);
        }
    }

    /// Block until the device is triggerable. Returns `false` if
    /// termination won the race.
    pub fn wait_until_triggerable(&self) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if self.terminating() {
                return false;
            }
            if inner.state == CaptureState::Triggerable {
                return true;
            }
            self.trigger.wait(&mut inner);
        }
    }

    /// Same, bounded. For tests and diagnostics.
    pub fn wait_until_triggerable_timeout(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.terminating() {
                return false;
            }
            if inner.state == CaptureState::Triggerable {
                return true;
            }
            if self
                .trigger
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.state == CaptureState::Triggerable;
            }
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn conditional_transition_only_fires_from_matching_state() {
        let cell = StatusCell::new();
        assert!(cell.transition_if(CaptureState::Waiting, CaptureState::Triggerable));
        assert!(!cell.transition_if(CaptureState::Waiting, CaptureState::InProgress));
        assert_eq!(cell.state(), CaptureState::Triggerable);
    }

    #[test]
    fn trigger_guard_needs_two_video_frames() {
        let cell = StatusCell::new();
        assert!(!cell.on_video_packet(true));
        // Mid-frame packets do not advance the count.
        assert!(!cell.on_video_packet(false));
        assert!(cell.on_video_packet(true));
        cell.reset_video_frame_count();
        assert!(!cell.on_video_packet(true));
    }

    #[test]
    fn finalize_depends_on_busy() {
        let cell = StatusCell::new();
        cell.force(CaptureState::InProgress);
        assert_eq!(cell.finalize_frame(), CaptureState::Waiting);

        assert!(cell.try_set_busy(true));
        cell.force(CaptureState::InProgress);
        assert_eq!(cell.finalize_frame(), CaptureState::Success);
    }

    #[test]
    fn release_resets_state() {
        let cell = StatusCell::new();
        cell.try_set_busy(false);
        cell.force(CaptureState::Success);
        cell.release();
        assert_eq!(cell.state(), CaptureState::Waiting);
        assert!(!cell.busy());
    }

    #[test]
    fn exclusive_open_rejects_second_holder() {
        let cell = StatusCell::new();
        assert!(cell.try_set_busy(true));
        assert!(!cell.try_set_busy(true));
        // Non-exclusive mode admits anyone.
        assert!(cell.try_set_busy(false));
    }

    #[test]
    fn termination_drains_trigger_waiters() {
        let cell = Arc::new(StatusCell::new());
        let waiter = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.wait_until_triggerable())
        };
        thread::sleep(Duration::from_millis(20));
        cell.set_terminating();
        assert!(!waiter.join().expect("waiter thread"));
    }

    #[test]
    fn trigger_wait_sees_transition() {
        let cell = Arc::new(StatusCell::new());
        let waiter = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.wait_until_triggerable())
        };
        thread::sleep(Duration::from_millis(20));
        cell.force(CaptureState::Triggerable);
        cell.wake_trigger();
        assert!(waiter.join().expect("waiter thread"));
    }
}
