//! UVC wire-protocol subset for still-image capture.
//!
//! This crate is intentionally I/O-free and allocation-light on hot paths.
//! It provides pure functions and types that can be tested and fuzzed
//! without hardware or OS-level USB plumbing: per-packet payload header
//! decoding, the probe/commit control layouts, class-specific descriptor
//! parsing, unit-property envelopes, and the per-device quirk table.

#![deny(static_mut_refs)]

pub mod control;
pub mod descriptor;
pub mod payload;
pub mod property;
pub mod quirks;

// Flat re-exports so callers can use `openstill_uvc_protocol::Foo`.
pub use control::{
    STILL_CONTROL_LEN, STREAMING_CONTROL_LEN, StillControl, StreamingControl, is_device_to_host,
    request, vs_selector,
};
pub use descriptor::{
    ControlLayout, FrameSize, MAX_STILL_SIZE_PATTERNS, StreamingLayout, decode_endpoint_packet_size,
    parse_control_interface, parse_streaming_interface,
};
pub use payload::{HEADER_LEN, PacketClass, PayloadFlags, header_flags, split_packet};
pub use property::{
    MAX_PROPERTY_ENVELOPE, PROPERTY_HEADER_LEN, PropertyError, UnitProperty, is_valid_get_request,
    is_valid_set_request,
};
pub use quirks::{DeviceQuirks, UNITY_PRODUCT_ID, UNITY_VENDOR_ID, unity_selector};
