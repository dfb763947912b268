//! Class-specific descriptor parsing for the VideoControl and
//! VideoStreaming interfaces.
//!
//! The descriptors arrive as the raw `extra` bytes of the interface
//! descriptor: a sequence of length-prefixed blocks. Only the subset
//! needed for still capture is decoded; unknown blocks are skipped.

#![deny(static_mut_refs)]

/// Descriptor type for class-specific interface descriptors.
pub const CS_INTERFACE: u8 = 0x24;

/// VideoControl interface descriptor subtypes.
pub mod vc_subtype {
    pub const HEADER: u8 = 0x01;
    pub const INPUT_TERMINAL: u8 = 0x02;
    pub const OUTPUT_TERMINAL: u8 = 0x03;
    pub const SELECTOR_UNIT: u8 = 0x04;
    pub const PROCESSING_UNIT: u8 = 0x05;
    pub const EXTENSION_UNIT: u8 = 0x06;
}

/// VideoStreaming interface descriptor subtypes.
pub mod vs_subtype {
    pub const INPUT_HEADER: u8 = 0x01;
    pub const OUTPUT_HEADER: u8 = 0x02;
    pub const STILL_IMAGE_FRAME: u8 = 0x03;
}

/// Input terminal type for a camera sensor.
pub const ITT_CAMERA: u16 = 0x0201;

/// Upper bound on retained still frame-size patterns.
pub const MAX_STILL_SIZE_PATTERNS: usize = 10;

/// One (width, height) entry from the Still-Image-Frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Entities and streaming interface numbers discovered on the
/// VideoControl interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlLayout {
    pub camera_terminal: Option<u8>,
    pub processing_unit: Option<u8>,
    pub extension_unit: Option<u8>,
    /// Interface numbers listed in the VC header's baInterfaceNr array.
    pub streaming_interfaces: Vec<u8>,
}

/// Stream topology discovered on a VideoStreaming interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingLayout {
    /// Data endpoint address from the VS input header.
    pub endpoint_address: Option<u8>,
    /// bStillCaptureMethod from the VS input header.
    pub still_capture_method: Option<u8>,
    /// Frame sizes from the Still-Image-Frame descriptor, in descriptor
    /// order, capped at [`MAX_STILL_SIZE_PATTERNS`].
    pub frame_sizes: Vec<FrameSize>,
    /// Index of the widest catalogue entry; the initial selection.
    pub preferred_index: usize,
}

/// Iterator over length-prefixed descriptor blocks.
struct Blocks<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.buf.len() < 3 {
            return None;
        }
        let len = self.buf[0] as usize;
        if len < 2 || len > self.buf.len() {
            // Malformed length; stop walking rather than loop.
            return None;
        }
        let (block, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(block)
    }
}

fn blocks(extra: &[u8]) -> Blocks<'_> {
    Blocks { buf: extra }
}

/// Walk the VideoControl interface's class-specific descriptors.
pub fn parse_control_interface(extra: &[u8]) -> ControlLayout {
    let mut layout = ControlLayout::default();

    for block in blocks(extra) {
        if block.len() < 3 || block[1] != CS_INTERFACE {
            continue;
        }
        match block[2] {
            vc_subtype::HEADER => {
                // bInCollection at offset 11, interface numbers follow.
                let n = if block.len() >= 12 { block[11] as usize } else { 0 };
                if block.len() >= 12 + n {
                    layout.streaming_interfaces.extend_from_slice(&block[12..12 + n]);
                }
            }
            vc_subtype::INPUT_TERMINAL => {
                if block.len() >= 6 {
                    let terminal_type = u16::from_le_bytes([block[4], block[5]]);
                    if terminal_type == ITT_CAMERA {
                        layout.camera_terminal = Some(block[3]);
                    }
                }
            }
            vc_subtype::PROCESSING_UNIT => {
                if block.len() >= 4 {
                    layout.processing_unit = Some(block[3]);
                }
            }
            vc_subtype::EXTENSION_UNIT => {
                if block.len() >= 4 {
                    layout.extension_unit = Some(block[3]);
                }
            }
            _ => {}
        }
    }

    layout
}

/// Walk a VideoStreaming interface's class-specific descriptors.
pub fn parse_streaming_interface(extra: &[u8]) -> StreamingLayout {
    let mut layout = StreamingLayout::default();

    for block in blocks(extra) {
        if block.len() < 3 || block[1] != CS_INTERFACE {
            continue;
        }
        match block[2] {
            vs_subtype::INPUT_HEADER => {
                if block.len() >= 7 {
                    layout.endpoint_address = Some(block[6]);
                }
                if block.len() >= 10 {
                    layout.still_capture_method = Some(block[9]);
                }
            }
            vs_subtype::STILL_IMAGE_FRAME => {
                // bNumImageSizePatterns at offset 4, (wWidth, wHeight)
                // little-endian pairs follow.
                if block.len() < 5 {
                    continue;
                }
                let n = (block[4] as usize).min(MAX_STILL_SIZE_PATTERNS);
                let mut widest = 0usize;
                for i in 0..n {
                    let at = 5 + i * 4;
                    if block.len() < at + 4 {
                        break;
                    }
                    let width = u16::from_le_bytes([block[at], block[at + 1]]) as u32;
                    let height = u16::from_le_bytes([block[at + 2], block[at + 3]]) as u32;
                    layout.frame_sizes.push(FrameSize { width, height });
                    if width > layout.frame_sizes[widest].width {
                        widest = layout.frame_sizes.len() - 1;
                    }
                }
                layout.preferred_index = widest;
            }
            _ => {}
        }
    }

    layout
}

/// Decode an endpoint's wMaxPacketSize field into bytes per interval,
/// accounting for high-bandwidth multipliers in bits 11..13.
pub fn decode_endpoint_packet_size(w_max_packet_size: u16) -> u32 {
    let base = (w_max_packet_size & 0x07ff) as u32;
    let mult = 1 + ((w_max_packet_size >> 11) & 0x3) as u32;
    base * mult
}
