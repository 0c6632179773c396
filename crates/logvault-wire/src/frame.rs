//! Frame encoding and decoding for the wire protocol.
//!
//! A frame is a big-endian `u32` length followed by that many bytes of a
//! bincode-packed message. The same framing is used on the wire and in
//! store-and-forward journal files.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};

/// Size of the length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Maximum payload size (512 KiB). A length prefix above this is fatal
/// for the connection.
pub const MESSAGE_SIZE_MAX: u32 = 512 * 1024;

/// A complete frame: the payload of one protocol record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload bytes (the packed message, without the length prefix).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame from a payload.
    ///
    /// Fails if the payload exceeds [`MESSAGE_SIZE_MAX`].
    pub fn new(payload: Bytes) -> WireResult<Self> {
        if payload.len() > MESSAGE_SIZE_MAX as usize {
            return Err(WireError::ServerMessageTooLarge {
                size: payload.len(),
                max: MESSAGE_SIZE_MAX,
            });
        }
        Ok(Self { payload })
    }

    /// Encodes the frame into a byte buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(LEN_PREFIX_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Encodes the frame to a new byte buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Attempts to decode a frame from a byte buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded; the
    /// consumed bytes are removed from the buffer. Returns `Ok(None)` if
    /// more bytes are needed, after reserving enough capacity for the
    /// announced record so the next socket read can complete it. Returns
    /// `Err` if the length prefix exceeds [`MESSAGE_SIZE_MAX`].
    pub fn decode(buf: &mut BytesMut) -> WireResult<Option<Self>> {
        if buf.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length without consuming it.
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len > MESSAGE_SIZE_MAX {
            return Err(WireError::ClientMessageTooLarge {
                size: len,
                max: MESSAGE_SIZE_MAX,
            });
        }

        let total = LEN_PREFIX_SIZE + len as usize;
        if buf.len() < total {
            // Incomplete record; make room for the rest.
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(LEN_PREFIX_SIZE);
        let payload = buf.split_to(len as usize).freeze();
        Ok(Some(Self { payload }))
    }

    /// Returns the total size of the frame on the wire.
    pub fn total_size(&self) -> usize {
        LEN_PREFIX_SIZE + self.payload.len()
    }
}
