//! gRPC message framing and the echo payload codec.
//!
//! Wire format per message: 1 byte compress flag (0 = uncompressed), 4 byte
//! big-endian length, payload. The echo protocol's payload is a protobuf
//! message with a single string field (field 1, length-delimited).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors produced while decoding gRPC messages or echo payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compressed messages are not supported")]
    Compressed,

    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Encode a text payload as one length-prefixed gRPC message.
pub fn encode_text(text: &str) -> Bytes {
    let mut body = BytesMut::with_capacity(2 + text.len());
    // Protobuf field 1, wire type 2 (length-delimited).
    body.put_u8(0x0a);
    put_varint(&mut body, text.len() as u64);
    body.put_slice(text.as_bytes());

    let mut framed = BytesMut::with_capacity(5 + body.len());
    framed.put_u8(0); // compress flag: uncompressed
    framed.put_u32(body.len() as u32);
    framed.put_slice(&body);
    framed.freeze()
}

/// Decode the text payload of one gRPC message (length prefix stripped).
pub fn decode_text(payload: &[u8]) -> Result<String, CodecError> {
    if payload.is_empty() {
        // Absent field: proto3 default.
        return Ok(String::new());
    }

    let mut rest = payload;
    let (&tag, tail) = rest
        .split_first()
        .ok_or(CodecError::Malformed("empty payload"))?;
    rest = tail;
    if tag != 0x0a {
        return Err(CodecError::Malformed("unexpected field tag"));
    }

    let len = get_varint(&mut rest).ok_or(CodecError::Malformed("truncated length"))? as usize;
    if rest.len() < len {
        return Err(CodecError::Malformed("truncated string field"));
    }

    Ok(std::str::from_utf8(&rest[..len])?.to_string())
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = buf.split_first()?;
        *buf = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

/// Per-stream buffer reassembling gRPC messages from data frame chunks.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Append bytes from a data frame.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to drain one complete message payload. Returns `None` while the
    /// buffered bytes do not yet hold a full message.
    pub fn try_decode(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        if self.buf[0] != 0 {
            return Err(CodecError::Compressed);
        }

        let length = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < 5 + length {
            return Ok(None);
        }

        let mut message = self.buf.split_to(5 + length);
        let payload = message.split_off(5);
        Ok(Some(payload.freeze()))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let framed = encode_text("reply-from-server");
        assert_eq!(framed[0], 0);

        let mut buffer = MessageBuffer::new();
        buffer.push(&framed);
        let payload = buffer.try_decode().unwrap().expect("complete message");
        assert_eq!(decode_text(&payload).unwrap(), "reply-from-server");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_text() {
        let framed = encode_text("");
        let mut buffer = MessageBuffer::new();
        buffer.push(&framed);
        let payload = buffer.try_decode().unwrap().expect("complete message");
        assert_eq!(decode_text(&payload).unwrap(), "");
    }

    #[test]
    fn test_reassembly_from_split_chunks() {
        let framed = encode_text("reassembled message");
        let mut buffer = MessageBuffer::new();

        buffer.push(&framed[..3]);
        assert!(buffer.try_decode().unwrap().is_none());

        buffer.push(&framed[3..8]);
        assert!(buffer.try_decode().unwrap().is_none());

        buffer.push(&framed[8..]);
        let payload = buffer.try_decode().unwrap().expect("complete message");
        assert_eq!(decode_text(&payload).unwrap(), "reassembled message");
    }

    #[test]
    fn test_multiple_messages_in_one_buffer() {
        let mut buffer = MessageBuffer::new();
        buffer.push(&encode_text("first"));
        buffer.push(&encode_text("second"));

        let first = buffer.try_decode().unwrap().unwrap();
        assert_eq!(decode_text(&first).unwrap(), "first");
        let second = buffer.try_decode().unwrap().unwrap();
        assert_eq!(decode_text(&second).unwrap(), "second");
        assert!(buffer.try_decode().unwrap().is_none());
    }

    #[test]
    fn test_compressed_flag_rejected() {
        let mut buffer = MessageBuffer::new();
        buffer.push(&[1, 0, 0, 0, 0]);
        assert!(matches!(buffer.try_decode(), Err(CodecError::Compressed)));
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        assert!(matches!(
            decode_text(&[0x12, 0x01, b'x']),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_field() {
        // Claims 10 bytes of string but carries 2.
        assert!(matches!(
            decode_text(&[0x0a, 0x0a, b'a', b'b']),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_varint_boundary() {
        let text = "x".repeat(300);
        let framed = encode_text(&text);
        let mut buffer = MessageBuffer::new();
        buffer.push(&framed);
        let payload = buffer.try_decode().unwrap().unwrap();
        assert_eq!(decode_text(&payload).unwrap(), text);
    }
}
