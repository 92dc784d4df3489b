//! Frame Protocol
//!
//! Wire format for framed mode: every payload is preceded by its length.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+------------------------------------------+
//! | Length (4)     | Payload (variable)                       |
//! | native u32     | serializer output                        |
//! +----------------+------------------------------------------+
//! ```
//!
//! There is no magic number, version byte or checksum, and an empty payload
//! (`length = 0`) is a valid frame. The length uses the platform's native
//! byte order, so both peers must share endianness.
//!
//! # Hardening
//!
//! The length header is not bounded by default: a corrupt or hostile header
//! makes the reader wait for that many bytes. [`FrameDecoder::with_max_frame_len`]
//! turns that into a [`TransportError::FrameTooLarge`] as soon as the header
//! is seen.

use crate::constants::FRAME_HEADER_LEN;

use super::TransportError;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Encode a payload into a length-prefixed frame
///
/// # Errors
///
/// Returns `TransportError::FrameTooLarge` if the payload length does not
/// fit in the 32-bit header.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len() as u64,
        max: u64::from(u32::MAX),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a length header
///
/// No upper bound is applied here; see [`FrameDecoder::with_max_frame_len`].
#[inline]
#[must_use]
pub fn decode_header(header: [u8; FRAME_HEADER_LEN]) -> u32 {
    u32::from_ne_bytes(header)
}

/// Split one complete frame into its payload
///
/// Bytes after the announced payload are ignored.
///
/// # Errors
///
/// Returns `TransportError::InvalidState` if `frame` is shorter than its
/// header claims.
pub fn decode(frame: &[u8]) -> Result<&[u8], TransportError> {
    let Some((header, rest)) = frame.split_first_chunk::<FRAME_HEADER_LEN>() else {
        return Err(TransportError::InvalidState(format!(
            "Truncated frame header: {} bytes",
            frame.len()
        )));
    };

    let len = decode_header(*header) as usize;
    rest.get(..len).ok_or_else(|| {
        TransportError::InvalidState(format!(
            "Truncated frame: header announces {len} bytes, {} present",
            rest.len()
        ))
    })
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete payloads. A header split
/// across reads is kept until the rest of it arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    /// Largest accepted payload, if bounded
    max_frame_len: Option<u32>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder that accepts any announced length
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_frame_len: None,
        }
    }

    /// Create a decoder that rejects frames longer than `max`
    #[must_use]
    pub fn with_max_frame_len(max: Option<u32>) -> Self {
        Self {
            max_frame_len: max,
            ..Self::new()
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Whether a frame has started but not yet completed
    #[must_use]
    pub fn has_partial_frame(&self) -> bool {
        self.available() > 0
    }

    /// Try to take the next complete payload
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was buffered
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::FrameTooLarge)` if the header exceeds the limit
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let available = self.available();
        if available < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + FRAME_HEADER_LEN]);
        let len = decode_header(header);

        if let Some(max) = self.max_frame_len {
            if len > max {
                return Err(TransportError::FrameTooLarge {
                    len: u64::from(len),
                    max: u64::from(max),
                });
            }
        }

        let len = len as usize;
        // `available >= FRAME_HEADER_LEN` here; adding to `len` could overflow
        if available - FRAME_HEADER_LEN < len {
            return Ok(None);
        }

        let payload_start = self.read_pos + FRAME_HEADER_LEN;
        let payload_end = payload_start + len;
        let payload = self.buffer[payload_start..payload_end].to_vec();

        // Advance read position
        self.read_pos = payload_end;

        Ok(Some(payload))
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}
