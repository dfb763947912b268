//! UVC payload header decode and packet classification.
//!
//! Every packet on the streaming endpoint starts with a 12-byte payload
//! header; byte 0 is the header length and byte 1 carries the flags that
//! distinguish still-image payloads from the video preview.

#![deny(static_mut_refs)]

/// Expected value of the header length byte.
pub const HEADER_LEN: usize = 12;

/// Named bits of the payload header flags byte.
pub mod header_flags {
    /// Frame identifier; toggles between successive frames.
    pub const FID: u8 = 0x01;
    /// End of frame.
    pub const EOF: u8 = 0x02;
    /// Still-image payload (vs video preview).
    pub const STI: u8 = 0x20;
}

/// Decoded payload header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadFlags(u8);

impl PayloadFlags {
    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    /// Frame identifier bit.
    pub fn frame_id(self) -> bool {
        self.0 & header_flags::FID != 0
    }

    /// End-of-frame bit.
    pub fn end_of_frame(self) -> bool {
        self.0 & header_flags::EOF != 0
    }

    /// Still-image bit.
    pub fn still_image(self) -> bool {
        self.0 & header_flags::STI != 0
    }

    pub fn class(self) -> PacketClass {
        if self.still_image() {
            PacketClass::Still
        } else {
            PacketClass::Video
        }
    }
}

/// Payload classification derived from the STI flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Video preview data; discarded by the still pipeline.
    Video,
    /// Still-image data; forwarded to frame reassembly.
    Still,
}

/// Split one streaming packet into flags and payload bytes.
///
/// Returns `None` for packets that must be skipped: shorter than two
/// bytes, or carrying a header length byte other than 12 (malformed).
/// A header-only packet yields an empty payload slice; its flags may
/// still carry EOF.
pub fn split_packet(packet: &[u8]) -> Option<(PayloadFlags, &[u8])> {
    if packet.len() < 2 {
        return None;
    }
    if packet[0] as usize != HEADER_LEN {
        return None;
    }
    let flags = PayloadFlags::from_raw(packet[1]);
    let payload = if packet.len() > HEADER_LEN {
        &packet[HEADER_LEN..]
    } else {
        &[]
    };
    Some((flags, payload))
}
