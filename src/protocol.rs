//! Client message framing.
//!
//! A [`ClientMessage`] is the encoded form exchanged with a connection:
//!
//! ```text
//! +------------+--------------+-----------------+-------------+
//! | length u32 | msg type u32 | correlation u64 | payload ... |
//! +------------+--------------+-----------------+-------------+
//! ```
//!
//! All integers are little-endian; `length` covers the whole frame. Payloads
//! are built with [`PayloadWriter`] and read back with [`PayloadReader`].

use crate::error::{HzlinkError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Message type ids.
pub mod message_type {
    pub const ERROR: u32 = 0x0000_0000;
    pub const ADD_ENTRY_LISTENER_REQUEST: u32 = 0x0001_1900;
    pub const ADD_ENTRY_LISTENER_RESPONSE: u32 = 0x0001_1901;
    pub const ENTRY_EVENT: u32 = 0x0001_1902;
    pub const REMOVE_ENTRY_LISTENER_REQUEST: u32 = 0x0001_1a00;
    pub const REMOVE_ENTRY_LISTENER_RESPONSE: u32 = 0x0001_1a01;
}

/// One framed request, response or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub message_type: u32,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl ClientMessage {
    pub fn new(message_type: u32, payload: Bytes) -> Self {
        Self {
            message_type,
            correlation_id: 0,
            payload,
        }
    }

    /// Same message, stamped with `correlation_id`.
    pub fn with_correlation_id(mut self, correlation_id: u64) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Error response carrying `reason`.
    pub fn error(correlation_id: u64, reason: &str) -> Self {
        let mut writer = PayloadWriter::new();
        writer.put_str(reason);
        Self::new(message_type::ERROR, writer.finish()).with_correlation_id(correlation_id)
    }

    pub fn is_error(&self) -> bool {
        self.message_type == message_type::ERROR
    }

    /// Turn an error response into `Err(Remote)`, pass anything else through.
    pub fn into_result(self) -> Result<Self> {
        if self.is_error() {
            let reason = PayloadReader::new(self.payload).get_str()?;
            return Err(HzlinkError::Remote(reason));
        }
        Ok(self)
    }

    /// Fail with a decode error unless the message has `expected` type.
    pub fn expect_type(&self, expected: u32) -> Result<()> {
        if self.message_type != expected {
            return Err(HzlinkError::Decode(format!(
                "expected message type {:#x}, got {:#x}",
                expected, self.message_type
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32_le((HEADER_LEN + self.payload.len()) as u32);
        buf.put_u32_le(self.message_type);
        buf.put_u64_le(self.correlation_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(HzlinkError::Decode(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let length = frame.get_u32_le() as usize;
        if length != frame.len() + 4 {
            return Err(HzlinkError::Decode(format!(
                "frame length {} does not match {} received bytes",
                length,
                frame.len() + 4
            )));
        }
        let message_type = frame.get_u32_le();
        let correlation_id = frame.get_u64_le();
        Ok(Self {
            message_type,
            correlation_id,
            payload: frame,
        })
    }
}

/// Builds a message payload.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Presence flag followed by the value when present.
    pub fn put_opt_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            Some(v) => {
                self.put_bool(true);
                self.put_bytes(v);
            }
            None => self.put_bool(false),
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads a payload written by [`PayloadWriter`]. Every getter fails with
/// [`HzlinkError::Decode`] on truncated input.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(HzlinkError::Decode(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_bytes(&mut self) -> Result<Bytes> {
        self.need(4, "length prefix")?;
        let len = self.buf.get_u32_le() as usize;
        self.need(len, "byte string")?;
        Ok(self.buf.split_to(len))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| HzlinkError::Decode(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn get_opt_bytes(&mut self) -> Result<Option<Bytes>> {
        if self.get_bool()? {
            self.get_bytes().map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let msg = ClientMessage::new(message_type::ENTRY_EVENT, Bytes::from_static(b"abc"))
            .with_correlation_id(7);
        let frame = msg.encode();
        assert_eq!(frame.len(), HEADER_LEN + 3);
        assert_eq!(&frame[0..4], &(19u32).to_le_bytes());
        assert_eq!(ClientMessage::decode(frame).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(ClientMessage::decode(Bytes::from_static(b"short")).is_err());

        let mut frame = ClientMessage::new(1, Bytes::from_static(b"xy"))
            .encode()
            .to_vec();
        frame.pop();
        assert!(matches!(
            ClientMessage::decode(Bytes::from(frame)),
            Err(HzlinkError::Decode(_))
        ));
    }

    #[test]
    fn test_error_message_into_result() {
        let err = ClientMessage::error(5, "no such map").into_result();
        match err {
            Err(HzlinkError::Remote(reason)) => assert_eq!(reason, "no such map"),
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_reader_truncation() {
        let mut writer = PayloadWriter::new();
        writer.put_str("service");
        writer.put_opt_bytes(None);
        writer.put_u64(99);
        let payload = writer.finish();

        let mut reader = PayloadReader::new(payload.clone());
        assert_eq!(reader.get_str().unwrap(), "service");
        assert_eq!(reader.get_opt_bytes().unwrap(), None);
        assert_eq!(reader.get_u64().unwrap(), 99);
        assert!(reader.get_u8().is_err());

        let mut short = PayloadReader::new(payload.slice(0..6));
        assert!(short.get_str().is_err());
    }
}
