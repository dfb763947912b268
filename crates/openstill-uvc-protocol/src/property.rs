//! Unit-property envelope for camera, processing, and extension unit
//! controls.
//!
//! The envelope is `{ u16 data_len; u8 control_selector; u8 request;
//! u8 data[data_len] }`, little-endian, and must fit in a 64-byte buffer
//! end to end.

#![deny(static_mut_refs)]

use crate::control::request;

/// Size of the fixed envelope header.
pub const PROPERTY_HEADER_LEN: usize = 4;

/// Hard cap on the whole envelope, header included.
pub const MAX_PROPERTY_ENVELOPE: usize = 64;

/// Envelope validation and parse failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    #[error("property envelope truncated: {0} bytes")]
    Truncated(usize),
    #[error("property data length {0} exceeds the 64-byte envelope")]
    TooLarge(usize),
    #[error("request {0:#04x} is not valid for this direction")]
    BadRequest(u8),
}

/// A property get/set forwarded to a terminal or unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitProperty {
    pub control_selector: u8,
    pub request: u8,
    pub data: Vec<u8>,
}

/// Only SET_CUR may write a property.
pub fn is_valid_set_request(request_code: u8) -> bool {
    request_code == request::SET_CUR
}

/// Reads may use any of the GET_* value requests.
pub fn is_valid_get_request(request_code: u8) -> bool {
    matches!(
        request_code,
        request::GET_CUR | request::GET_MIN | request::GET_MAX | request::GET_RES | request::GET_DEF
    )
}

impl UnitProperty {
    /// Parse an envelope, enforcing the 64-byte cap.
    ///
    /// `bytes` may be longer than the envelope; only
    /// `PROPERTY_HEADER_LEN + data_len` bytes are consumed.
    pub fn parse(bytes: &[u8]) -> Result<Self, PropertyError> {
        if bytes.len() < PROPERTY_HEADER_LEN {
            return Err(PropertyError::Truncated(bytes.len()));
        }
        let data_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if PROPERTY_HEADER_LEN + data_len > MAX_PROPERTY_ENVELOPE {
            return Err(PropertyError::TooLarge(data_len));
        }
        if bytes.len() < PROPERTY_HEADER_LEN + data_len {
            return Err(PropertyError::Truncated(bytes.len()));
        }
        Ok(Self {
            control_selector: bytes[2],
            request: bytes[3],
            data: bytes[PROPERTY_HEADER_LEN..PROPERTY_HEADER_LEN + data_len].to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, PropertyError> {
        if PROPERTY_HEADER_LEN + self.data.len() > MAX_PROPERTY_ENVELOPE {
            return Err(PropertyError::TooLarge(self.data.len()));
        }
        let mut out = Vec::with_capacity(PROPERTY_HEADER_LEN + self.data.len());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.push(self.control_selector);
        out.push(self.request);
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}
