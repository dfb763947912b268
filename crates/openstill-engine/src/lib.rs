//! Still-capture streaming engine for UVC cameras.
//!
//! The engine sits between a USB host controller and its callers. It
//! negotiates still and video parameters over the control pipe, keeps a
//! ring of transfer requests in flight on the streaming endpoint,
//! demultiplexes still payloads out of the video preview, reassembles
//! them into a paged frame buffer, and exposes character-device
//! semantics (`open`, `read`, `ioctl`, `close`) through
//! [`CaptureHandle`].
//!
//! Three execution contexts interact:
//!
//! 1. the transfer pump servicing completions (may only touch the short
//!    pool locks),
//! 2. one deferred worker per device copying packet bytes into the frame
//!    buffer,
//! 3. caller threads reading frames and issuing ioctls.
//!
//! The hardware seam is the [`HostController`] trait, so everything here
//! can run against a scripted controller in tests.

pub mod capture;
pub mod control_plane;
pub mod controller;
pub mod device;
pub mod frame_buf;
pub mod handle;
pub mod ioctl;
pub mod pool;
pub mod stats;
pub mod status;
pub mod stream;

pub use control_plane::{ControlPlane, RetryPolicy, CTRL_TIMEOUT};
pub use controller::{ControlSetup, HostController, PacketTable, MAX_PACKETS_PER_TRANSFER};
pub use device::{DeviceDescription, EngineTuning, StillDevice, UnitIds};
pub use frame_buf::{FrameBuffer, FRAME_BUF_NUM_PAGES, FRAME_BUF_PAGE_SIZE};
pub use handle::{CaptureHandle, ReadInterrupter};
pub use ioctl::{codes, FrameSizeArg, UnitKind};
pub use pool::{BufferPool, PoolBuffer};
pub use status::{CaptureState, StatusCell};
pub use stream::{TransferRing, NUM_TRANSFER_REQUESTS};
