//! Per-device quirks and the Unity sensor-board vendor extension.
//!
//! Some firmware deviates from the UVC negotiation sequence in ways that
//! require workarounds. Quirks are looked up once at probe time by
//! VID/PID and consulted by the control plane.

#![deny(static_mut_refs)]

/// Unity sensor board vendor id.
pub const UNITY_VENDOR_ID: u16 = 0x2a12;
/// Unity sensor board product id.
pub const UNITY_PRODUCT_ID: u16 = 0x0001;

/// Extension-unit control selectors exposed by the Unity board.
pub mod unity_selector {
    /// 1 byte. 0 = Auto, 1 = Hold, 2 = Manual, 3 = Shutter, 4 = ISO.
    pub const EXPOSURE_MODE: u8 = 0x01;
    /// 2 bytes, range [-6, 6].
    pub const EV_CORRECTION: u8 = 0x02;
    /// 1 byte, range [1, 38].
    pub const SHUTTER_SPEED: u8 = 0x0a;
    /// 2 bytes, range [1, 65535], default 800.
    pub const GAIN: u8 = 0x0b;
    /// 8 bytes, read-only.
    pub const FIRMWARE_REV: u8 = 0x15;
}

/// Device-specific deviations from standard UVC behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceQuirks {
    /// Firmware rejects GET_CUR on STILL_COMMIT after a commit; skip the
    /// read-back verification step.
    pub skip_still_commit_readback: bool,
}

impl DeviceQuirks {
    /// Look up quirks for a device by VID/PID.
    pub fn for_device(vendor_id: u16, product_id: u16) -> Self {
        match (vendor_id, product_id) {
            (UNITY_VENDOR_ID, UNITY_PRODUCT_ID) => Self {
                skip_still_commit_readback: true,
            },
            _ => Self::default(),
        }
    }

    pub fn has_quirks(&self) -> bool {
        self.skip_still_commit_readback
    }
}
