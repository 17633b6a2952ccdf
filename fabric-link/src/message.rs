//! Link frame types and serialization.

use crate::error::{LinkError, LinkResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Protocol version marker that prefixes every frame.
pub const MAGIC_V1: [u8; 4] = [0x01, 0x02, 0x02, 0x00];

/// Length of the fixed message section.
pub const HEADER_LENGTH: usize = 4 + 4 + 1 + 1 + 1 + 2 + 2; // 15 bytes

/// Maximum encoded frame size (fits an unfragmented IPv4 UDP datagram on a
/// 1500 byte MTU).
pub const MAX_SEGMENT_SIZE: usize = 1472;

/// Largest payload that still fits in a single segment.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_SEGMENT_SIZE - HEADER_LENGTH;

/// Sequence number reserved for hello frames.
pub const HELLO_SEQUENCE: i32 = -1;

/// `replyFor` value used by a ping that does not answer another ping.
pub const NO_REPLY_FOR: i32 = -1;

/// Type of a link frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Identity announcement.
    Hello = 0,
    /// Liveness probe, optionally answering an earlier ping.
    Ping = 1,
    /// Data frame.
    Payload = 2,
    /// Delivery acknowledgement.
    Acknowledgement = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Payload),
            3 => Ok(Self::Acknowledgement),
            _ => Err("unknown message type"),
        }
    }
}

/// A single link frame.
///
/// The reserved headers length is always written as zero and the payload
/// length is derived from `payload`, so neither is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Per-sender counter, [`HELLO_SEQUENCE`] for hello frames.
    pub sequence: i32,
    /// Index of this fragment.
    pub fragment: u8,
    /// Total number of fragments. Only single-fragment messages are produced.
    pub of_fragments: u8,
    /// Frame type.
    pub message_type: MessageType,
    /// Frame body.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a single-fragment message.
    pub fn new(sequence: i32, message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            fragment: 0,
            of_fragments: 1,
            message_type,
            payload,
        }
    }

    /// Create a hello frame carrying the local identity token.
    pub fn hello(token: &str) -> Self {
        Self::new(HELLO_SEQUENCE, MessageType::Hello, token.as_bytes().to_vec())
    }

    /// Create a ping frame. `reply_for` is [`NO_REPLY_FOR`] unless answering
    /// a ping with that sequence.
    pub fn ping(sequence: i32, reply_for: i32) -> Self {
        Self::new(sequence, MessageType::Ping, reply_for.to_le_bytes().to_vec())
    }

    /// Whether this message is a single, unfragmented frame.
    pub fn is_single_fragment(&self) -> bool {
        self.fragment == 0 && self.of_fragments == 1
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }

    /// Serialize to wire bytes.
    ///
    /// Fails if the frame would exceed [`MAX_SEGMENT_SIZE`].
    pub fn encode(&self) -> LinkResult<Vec<u8>> {
        let len = self.encoded_len();
        if len > MAX_SEGMENT_SIZE {
            return Err(LinkError::protocol(format!("message too long [{}]", len)));
        }

        let mut buf = Vec::with_capacity(len);
        buf.write_all(&MAGIC_V1)?;
        buf.write_i32::<LittleEndian>(self.sequence)?;
        buf.write_u8(self.fragment)?;
        buf.write_u8(self.of_fragments)?;
        buf.write_u8(self.message_type as u8)?;
        buf.write_u16::<LittleEndian>(0)?; // headers length
        buf.write_u16::<LittleEndian>(self.payload.len() as u16)?;
        buf.write_all(&self.payload)?;

        Ok(buf)
    }

    /// Deserialize from wire bytes.
    pub fn decode(data: &[u8]) -> LinkResult<Self> {
        if data.len() < HEADER_LENGTH {
            return Err(LinkError::protocol(format!(
                "short read [{} < {}]",
                data.len(),
                HEADER_LENGTH
            )));
        }
        if data[..4] != MAGIC_V1 {
            return Err(LinkError::protocol("bad magic"));
        }

        let mut cursor = Cursor::new(&data[4..HEADER_LENGTH]);
        let sequence = cursor.read_i32::<LittleEndian>()?;
        let fragment = cursor.read_u8()?;
        let of_fragments = cursor.read_u8()?;
        let type_byte = cursor.read_u8()?;
        let headers_length = cursor.read_u16::<LittleEndian>()?;
        let payload_length = cursor.read_u16::<LittleEndian>()? as usize;

        if headers_length != 0 {
            return Err(LinkError::protocol(format!(
                "headers error [headers length {}]",
                headers_length
            )));
        }

        let message_type = MessageType::try_from(type_byte)
            .map_err(|e| LinkError::protocol(format!("{} [{}]", e, type_byte)))?;

        let end = HEADER_LENGTH + payload_length;
        if end > data.len() {
            return Err(LinkError::protocol(format!(
                "payload length {} exceeds frame [{} bytes remaining]",
                payload_length,
                data.len() - HEADER_LENGTH
            )));
        }

        Ok(Self {
            sequence,
            fragment,
            of_fragments,
            message_type,
            payload: data[HEADER_LENGTH..end].to_vec(),
        })
    }
}

/// Read the `replyFor` field of a ping payload.
pub fn read_reply_for(payload: &[u8]) -> LinkResult<i32> {
    if payload.len() != 4 {
        return Err(LinkError::protocol(format!(
            "ping expects 4 byte replyFor, got {} bytes",
            payload.len()
        )));
    }
    let mut cursor = Cursor::new(payload);
    Ok(cursor.read_i32::<LittleEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_encoding_matches_wire_layout() {
        let bytes = Message::hello("abc").encode().expect("encode");
        assert_eq!(
            bytes,
            vec![
                0x01, 0x02, 0x02, 0x00, // magic
                0xFF, 0xFF, 0xFF, 0xFF, // sequence -1
                0x00, 0x01, 0x00, // fragment, of fragments, type
                0x00, 0x00, // headers length
                0x03, 0x00, // payload length
                0x61, 0x62, 0x63,
            ]
        );
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let messages = vec![
            Message::hello("router-1"),
            Message::ping(7, NO_REPLY_FOR),
            Message::ping(i32::MAX, 42),
            Message::new(3, MessageType::Payload, vec![0xAB; MAX_PAYLOAD_LENGTH]),
            Message::new(9, MessageType::Acknowledgement, Vec::new()),
        ];

        for message in messages {
            let bytes = message.encode().expect("encode");
            let decoded = Message::decode(&bytes).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let message = Message::new(1, MessageType::Payload, vec![0; MAX_PAYLOAD_LENGTH + 1]);
        let err = message.encode().expect_err("should be too long");
        assert!(err.is_protocol());
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        for len in 0..HEADER_LENGTH {
            let data = vec![0u8; len];
            assert!(Message::decode(&data).expect_err("short").is_protocol());
        }
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = Message::ping(1, NO_REPLY_FOR).encode().expect("encode");
        bytes[3] = 0x01;
        let err = Message::decode(&bytes).expect_err("bad magic");
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_decode_rejects_nonzero_headers_length() {
        let mut bytes = Message::ping(1, NO_REPLY_FOR).encode().expect("encode");
        bytes[11] = 0x02;
        let err = Message::decode(&bytes).expect_err("headers");
        assert!(err.to_string().contains("headers"));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let bytes = Message::hello("abcdef").encode().expect("encode");
        let err = Message::decode(&bytes[..bytes.len() - 2]).expect_err("truncated");
        assert!(err.is_protocol());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = Message::ping(1, NO_REPLY_FOR).encode().expect("encode");
        bytes[10] = 9;
        assert!(Message::decode(&bytes).expect_err("type").is_protocol());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = Message::hello("abc").encode().expect("encode");
        bytes.extend_from_slice(&[0xEE, 0xEE]);
        let decoded = Message::decode(&bytes).expect("decode");
        assert_eq!(decoded.payload, b"abc");
    }

    #[test]
    fn test_reply_for_is_signed_little_endian() {
        assert_eq!(read_reply_for(&[0xFF, 0xFF, 0xFF, 0xFF]).expect("read"), -1);
        assert_eq!(read_reply_for(&[0x2A, 0x00, 0x00, 0x00]).expect("read"), 42);
        assert!(read_reply_for(&[0x01, 0x00, 0x00]).is_err());
        assert!(read_reply_for(&[0x01, 0x00, 0x00, 0x00, 0x00]).is_err());
    }
}
