//! Minimal memcached binary protocol framing for `GET_CLUSTER_CONFIG`.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 24;
pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Response carrying flexible framing extras.
pub const MAGIC_ALT_RESPONSE: u8 = 0x18;
pub const OPCODE_GET_CLUSTER_CONFIG: u8 = 0xb5;

/// Upper bound on a configuration body; real maps are a few hundred KiB.
const MAX_BODY_LEN: u32 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    NotMyVbucket,
    AuthError,
    UnknownCommand,
    NotSupported,
    Other(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x00 => Status::Success,
            0x07 => Status::NotMyVbucket,
            0x20 => Status::AuthError,
            0x81 => Status::UnknownCommand,
            0x83 => Status::NotSupported,
            other => Status::Other(other),
        }
    }

    /// The node cannot serve configuration at all; moving on needs no log.
    pub fn is_unsupported(self) -> bool {
        matches!(self, Status::UnknownCommand | Status::NotSupported)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad response magic 0x{0:02x}")]
    Magic(u8),
    #[error("response body of {0} bytes exceeds limit")]
    BodyTooLarge(u32),
    #[error("response body shorter than its extras and key")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("server replied with status {0:?}")]
    Status(Status),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub framing_len: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub status: Status,
    pub body_len: u32,
    pub opaque: u32,
}

impl ResponseHeader {
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let (framing_len, key_len) = match buf[0] {
            MAGIC_RESPONSE => (0, u16::from_be_bytes([buf[2], buf[3]])),
            MAGIC_ALT_RESPONSE => (buf[2], u16::from(buf[3])),
            other => return Err(FrameError::Magic(other)),
        };
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if body_len > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge(body_len));
        }
        Ok(Self {
            opcode: buf[1],
            framing_len,
            key_len,
            extras_len: buf[4],
            status: Status::from_code(u16::from_be_bytes([buf[6], buf[7]])),
            body_len,
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    fn value_offset(&self) -> usize {
        usize::from(self.framing_len) + usize::from(self.extras_len) + usize::from(self.key_len)
    }
}

/// Encodes a request header for a command with no key, extras or value.
pub fn encode_request(opcode: u8, opaque: u32) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = MAGIC_REQUEST;
    buf[1] = opcode;
    buf[12..16].copy_from_slice(&opaque.to_be_bytes());
    buf
}

/// Sends `GET_CLUSTER_CONFIG` and returns the response value.
///
/// Responses carrying another opaque are skipped, so a reused connection
/// with a late reply from an earlier request stays usable.
pub async fn fetch_cluster_config<S>(stream: &mut S, opaque: u32) -> Result<Vec<u8>, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&encode_request(OPCODE_GET_CLUSTER_CONFIG, opaque))
        .await?;
    stream.flush().await?;
    loop {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let header = ResponseHeader::decode(&header)?;
        let mut body = vec![0u8; header.body_len as usize];
        stream.read_exact(&mut body).await?;
        if header.opaque != opaque || header.opcode != OPCODE_GET_CLUSTER_CONFIG {
            continue;
        }
        if header.status != Status::Success {
            return Err(FetchError::Status(header.status));
        }
        let offset = header.value_offset();
        if offset > body.len() {
            return Err(FrameError::Truncated.into());
        }
        body.drain(..offset);
        return Ok(body);
    }
}

#[cfg(test)]
pub(crate) fn encode_response(opaque: u32, status: u16, value: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    buf[0] = MAGIC_RESPONSE;
    buf[1] = OPCODE_GET_CLUSTER_CONFIG;
    buf[6..8].copy_from_slice(&status.to_be_bytes());
    buf[8..12].copy_from_slice(&(value.len() as u32).to_be_bytes());
    buf[12..16].copy_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}
