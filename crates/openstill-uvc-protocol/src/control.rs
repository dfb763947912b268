//! Class control request codes, selectors, and the probe/commit payload
//! layouts used for still and video negotiation.

#![deny(static_mut_refs)]

/// UVC class-specific request codes.
pub mod request {
    pub const SET_CUR: u8 = 0x01;
    pub const GET_CUR: u8 = 0x81;
    pub const GET_MIN: u8 = 0x82;
    pub const GET_MAX: u8 = 0x83;
    pub const GET_RES: u8 = 0x84;
    pub const GET_LEN: u8 = 0x85;
    pub const GET_INFO: u8 = 0x86;
    pub const GET_DEF: u8 = 0x87;
}

/// VideoStreaming interface control selectors.
pub mod vs_selector {
    pub const PROBE_CONTROL: u8 = 0x01;
    pub const COMMIT_CONTROL: u8 = 0x02;
    pub const STILL_PROBE_CONTROL: u8 = 0x03;
    pub const STILL_COMMIT_CONTROL: u8 = 0x04;
    pub const STILL_IMAGE_TRIGGER_CONTROL: u8 = 0x05;
}

/// Transfer direction is encoded in the request code's high bit:
/// GET_* reads from the device, SET_CUR writes to it.
pub fn is_device_to_host(request: u8) -> bool {
    request & 0x80 != 0
}

/// Length of the legacy (UVC 1.0) streaming control layout.
pub const STREAMING_CONTROL_LEN: usize = 26;

/// Probe/commit payload for video negotiation, in the 26-byte legacy form.
///
/// All multi-byte fields are little-endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingControl {
    pub bm_hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
}

impl StreamingControl {
    pub fn encode(&self) -> [u8; STREAMING_CONTROL_LEN] {
        let mut out = [0u8; STREAMING_CONTROL_LEN];
        out[0..2].copy_from_slice(&self.bm_hint.to_le_bytes());
        out[2] = self.format_index;
        out[3] = self.frame_index;
        out[4..8].copy_from_slice(&self.frame_interval.to_le_bytes());
        out[8..10].copy_from_slice(&self.key_frame_rate.to_le_bytes());
        out[10..12].copy_from_slice(&self.p_frame_rate.to_le_bytes());
        out[12..14].copy_from_slice(&self.comp_quality.to_le_bytes());
        out[14..16].copy_from_slice(&self.comp_window_size.to_le_bytes());
        out[16..18].copy_from_slice(&self.delay.to_le_bytes());
        out[18..22].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        out
    }

    /// Parse the 26-byte layout. Longer buffers are accepted so the newer
    /// 34-byte variant degrades to the legacy fields.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < STREAMING_CONTROL_LEN {
            return None;
        }
        Some(Self {
            bm_hint: u16::from_le_bytes([data[0], data[1]]),
            format_index: data[2],
            frame_index: data[3],
            frame_interval: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            key_frame_rate: u16::from_le_bytes([data[8], data[9]]),
            p_frame_rate: u16::from_le_bytes([data[10], data[11]]),
            comp_quality: u16::from_le_bytes([data[12], data[13]]),
            comp_window_size: u16::from_le_bytes([data[14], data[15]]),
            delay: u16::from_le_bytes([data[16], data[17]]),
            max_video_frame_size: u32::from_le_bytes([data[18], data[19], data[20], data[21]]),
            max_payload_transfer_size: u32::from_le_bytes([data[22], data[23], data[24], data[25]]),
        })
    }
}

/// Length of the still probe/commit payload.
pub const STILL_CONTROL_LEN: usize = 11;

/// Probe/commit payload for still negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StillControl {
    pub format_index: u8,
    pub frame_index: u8,
    pub compression_index: u8,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
}

impl StillControl {
    pub fn encode(&self) -> [u8; STILL_CONTROL_LEN] {
        let mut out = [0u8; STILL_CONTROL_LEN];
        out[0] = self.format_index;
        out[1] = self.frame_index;
        out[2] = self.compression_index;
        out[3..7].copy_from_slice(&self.max_video_frame_size.to_le_bytes());
        out[7..11].copy_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < STILL_CONTROL_LEN {
            return None;
        }
        Some(Self {
            format_index: data[0],
            frame_index: data[1],
            compression_index: data[2],
            max_video_frame_size: u32::from_le_bytes([data[3], data[4], data[5], data[6]]),
            max_payload_transfer_size: u32::from_le_bytes([data[7], data[8], data[9], data[10]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_request_high_bit() {
        assert!(!is_device_to_host(request::SET_CUR));
        assert!(is_device_to_host(request::GET_CUR));
        assert!(is_device_to_host(request::GET_DEF));
    }

    #[test]
    fn still_control_wire_layout() {
        let msg = StillControl {
            format_index: 1,
            frame_index: 3,
            compression_index: 1,
            max_video_frame_size: 0xffff_ffff,
            max_payload_transfer_size: 0,
        };
        let wire = msg.encode();
        assert_eq!(wire[0], 1);
        assert_eq!(wire[1], 3);
        assert_eq!(wire[2], 1);
        assert_eq!(&wire[3..7], &[0xff; 4]);
        assert_eq!(&wire[7..11], &[0; 4]);
        assert_eq!(StillControl::parse(&wire), Some(msg));
    }

    #[test]
    fn streaming_control_frame_interval_offset() {
        let msg = StreamingControl {
            format_index: 1,
            frame_index: 1,
            frame_interval: 333_333,
            ..Default::default()
        };
        let wire = msg.encode();
        assert_eq!(
            u32::from_le_bytes([wire[4], wire[5], wire[6], wire[7]]),
            333_333
        );
        assert_eq!(StreamingControl::parse(&wire), Some(msg));
    }

    #[test]
    fn short_buffers_rejected() {
        assert!(StillControl::parse(&[0u8; 10]).is_none());
        assert!(StreamingControl::parse(&[0u8; 25]).is_none());
    }

    #[test]
    fn longer_streaming_layout_accepted() {
        // UVC 1.1 devices return 34 bytes; the legacy prefix still parses.
        let mut wire = [0u8; 34];
        wire[2] = 1;
        wire[3] = 2;
        let msg = StreamingControl::parse(&wire).expect("prefix parses");
        assert_eq!(msg.format_index, 1);
        assert_eq!(msg.frame_index, 2);
    }
}
