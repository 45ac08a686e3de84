//! Fixed-width length-prefixed framing shared by the relay and its clients.
//!
//! ```text
//! +----------------------------+---------------------------+
//! | 10 bytes: ASCII decimal    | N bytes: UTF-8 payload    |
//! | length, left-justified,    |                           |
//! | padded with spaces         |                           |
//! +----------------------------+---------------------------+
//! ```
//!
//! The first frame on a connection carries the username; every later frame
//! carries message text. Relayed items are the sender's identity frame
//! followed immediately by the message frame.

use std::{borrow::Cow, io};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the decimal length header in bytes.
pub const HEADER_LENGTH: usize = 10;

/// Largest payload length a header can represent (ten decimal digits).
pub const MAX_REPRESENTABLE_LEN: u64 = 9_999_999_999;

/// Default cap on declared payload lengths accepted from the network.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("header must be 10 bytes, got {0}")]
    HeaderLength(usize),

    #[error("header is not a decimal length: {0:?}")]
    InvalidHeader(String),

    #[error("declared payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("payload of {0} bytes does not fit in a 10-digit header")]
    PayloadTooLarge(usize),
}

/// One unit on the wire: the raw header exactly as received plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: [u8; HEADER_LENGTH],
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let payload = payload.into();
        let header = encode_header(payload.len())?;
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &[u8; HEADER_LENGTH] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Strict UTF-8 view of the payload.
    pub fn text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn into_text(self) -> Result<String, ProtocolError> {
        String::from_utf8(self.payload).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Wire bytes, header verbatim.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        self.extend_into(&mut bytes);
        bytes
    }

    pub fn extend_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.payload);
    }
}

pub fn encode_header(len: usize) -> Result<[u8; HEADER_LENGTH], FrameError> {
    if len as u64 > MAX_REPRESENTABLE_LEN {
        return Err(FrameError::PayloadTooLarge(len));
    }

    let mut header = [b' '; HEADER_LENGTH];
    let digits = len.to_string();
    header[..digits.len()].copy_from_slice(digits.as_bytes());
    Ok(header)
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header = encode_header(payload.len())?;
    let mut encoded = Vec::with_capacity(HEADER_LENGTH + payload.len());
    encoded.extend_from_slice(&header);
    encoded.extend_from_slice(payload);
    Ok(encoded)
}

pub fn decode_header(bytes: &[u8]) -> Result<u64, ProtocolError> {
    if bytes.len() != HEADER_LENGTH {
        return Err(ProtocolError::HeaderLength(bytes.len()));
    }

    let invalid = || ProtocolError::InvalidHeader(String::from_utf8_lossy(bytes).into_owned());
    let text = std::str::from_utf8(bytes).map_err(|_| invalid())?;
    let digits = text.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse().map_err(|_| invalid())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream before
/// sending any header byte; a stream ending mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R, max_payload_len: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LENGTH];
    let mut filled = 0;
    while filled < HEADER_LENGTH {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {filled} header bytes"),
            )
            .into());
        }
        filled += read;
    }

    let len = decode_header(&header)?;
    if len > max_payload_len as u64 {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: max_payload_len,
        }
        .into());
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame { header, payload }))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    // Header and payload go out in one write so peers never see half a frame
    // from us interleaved with anything else.
    let encoded = encode_frame(payload)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
