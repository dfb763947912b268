//! Message framing for the device sockets.
//!
//! Wire format, all little-endian:
//!
//! ```text
//! request:  u32 body_len | u8 op | u32 arg | payload
//! response: u32 body_len | i32 status | payload
//! ```
//!
//! `arg` is per-op: open flags (bit 0 = non-blocking), read length, or
//! the ioctl command code. `status` is 0 or a negative errno.

use thiserror::Error;

/// Frame length prefix size.
pub const LEN_PREFIX: usize = 4;

/// Request body header: op byte plus arg.
pub const REQUEST_HEADER_LEN: usize = 5;

/// Response body header: status.
pub const RESPONSE_HEADER_LEN: usize = 4;

/// Open flag: non-blocking reads.
pub const OPEN_NONBLOCK: u32 = 0x1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("message of {size} bytes exceeds the {limit}-byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("truncated message: {0} bytes")]
    Truncated(usize),
    #[error("unknown op code {0}")]
    UnknownOp(u8),
}

pub type IpcResult<T> = std::result::Result<T, IpcError>;

/// Session operations, mirroring file semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Open = 1,
    Release = 2,
    Read = 3,
    Write = 4,
    Ioctl = 5,
}

impl Op {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Op::Open),
            2 => Some(Op::Release),
            3 => Some(Op::Read),
            4 => Some(Op::Write),
            5 => Some(Op::Ioctl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub arg: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// 0 on success, negative errno on failure.
    pub status: i32,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self { status: 0, payload }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            payload: Vec::new(),
        }
    }
}

/// Encoder/decoder with a message size guard.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    /// Big enough for the largest single read a client can ask for.
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

    pub fn new() -> Self {
        Self {
            max_message_size: Self::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn check_size(&self, size: usize) -> IpcResult<()> {
        if size > self.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    /// Encode a request as a complete frame, length prefix included.
    pub fn encode_request(&self, request: &Request) -> IpcResult<Vec<u8>> {
        let body_len = REQUEST_HEADER_LEN + request.payload.len();
        self.check_size(body_len)?;
        let mut out = Vec::with_capacity(LEN_PREFIX + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.push(request.op as u8);
        out.extend_from_slice(&request.arg.to_le_bytes());
        out.extend_from_slice(&request.payload);
        Ok(out)
    }

    /// Decode a request body (the bytes after the length prefix).
    pub fn decode_request(&self, body: &[u8]) -> IpcResult<Request> {
        self.check_size(body.len())?;
        if body.len() < REQUEST_HEADER_LEN {
            return Err(IpcError::Truncated(body.len()));
        }
        let op = Op::from_raw(body[0]).ok_or(IpcError::UnknownOp(body[0]))?;
        let arg = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
        Ok(Request {
            op,
            arg,
            payload: body[REQUEST_HEADER_LEN..].to_vec(),
        })
    }

    /// Encode a response as a complete frame, length prefix included.
    pub fn encode_response(&self, response: &Response) -> IpcResult<Vec<u8>> {
        let body_len = RESPONSE_HEADER_LEN + response.payload.len();
        self.check_size(body_len)?;
        let mut out = Vec::with_capacity(LEN_PREFIX + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.extend_from_slice(&response.status.to_le_bytes());
        out.extend_from_slice(&response.payload);
        Ok(out)
    }

    /// Decode a response body (the bytes after the length prefix).
    pub fn decode_response(&self, body: &[u8]) -> IpcResult<Response> {
        self.check_size(body.len())?;
        if body.len() < RESPONSE_HEADER_LEN {
            return Err(IpcError::Truncated(body.len()));
        }
        Ok(Response {
            status: i32::from_le_bytes([body[0], body[1], body[2], body[3]]),
            payload: body[RESPONSE_HEADER_LEN..].to_vec(),
        })
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}
