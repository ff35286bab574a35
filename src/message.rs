//! # BitTorrent Peer Wire Messages
//!
//! Every message after the handshake shares one frame layout:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes (big-endian u32) - length of ID + payload
//! - **Message ID**: 1 byte - identifies the message type
//! - **Payload**: `length - 1` bytes of message-specific data
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | empty |
//! | 1 | UNCHOKE | empty |
//! | 2 | INTERESTED | empty |
//! | 3 | NOT INTERESTED | empty |
//! | 4 | HAVE | piece index (u32) |
//! | 5 | BITFIELD | piece availability bitmap |
//! | 6 | REQUEST | index, begin, length (3x u32) |
//! | 7 | PIECE | index, begin (2x u32), then block bytes |
//! | 8 | CANCEL | index, begin, length (3x u32) |
//! | 9 | PORT | DHT listen port (u16) |
//!
//! A frame with length 0 is a keep-alive: it has no ID and no payload, and
//! is modeled here as `None`. The parse helpers below reject any payload
//! whose size disagrees with its message kind.

use std::io::{Cursor, Read};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_PORT: MessageId = 9;

/// One non-keep-alive peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: Vec<u8>,
}

impl Message {
    pub fn choke() -> Message {
        Message {
            id: MESSAGE_CHOKE,
            payload: vec![],
        }
    }

    pub fn unchoke() -> Message {
        Message {
            id: MESSAGE_UNCHOKE,
            payload: vec![],
        }
    }

    pub fn interested() -> Message {
        Message {
            id: MESSAGE_INTERESTED,
            payload: vec![],
        }
    }

    pub fn not_interested() -> Message {
        Message {
            id: MESSAGE_NOT_INTERESTED,
            payload: vec![],
        }
    }

    pub fn have(index: u32) -> Message {
        Message {
            id: MESSAGE_HAVE,
            payload: index.to_be_bytes().to_vec(),
        }
    }

    pub fn bitfield(bitfield: Vec<u8>) -> Message {
        Message {
            id: MESSAGE_BITFIELD,
            payload: bitfield,
        }
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());

        Message {
            id: MESSAGE_REQUEST,
            payload,
        }
    }

    pub fn piece(index: u32, begin: u32, block: &[u8]) -> Message {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(block);

        Message {
            id: MESSAGE_PIECE,
            payload,
        }
    }

    pub fn cancel(index: u32, begin: u32, length: u32) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());

        Message {
            id: MESSAGE_CANCEL,
            payload,
        }
    }

    pub fn port(port: u16) -> Message {
        Message {
            id: MESSAGE_PORT,
            payload: port.to_be_bytes().to_vec(),
        }
    }

    /// Serialize the message into one wire frame.
    pub fn marshal(&self) -> Vec<u8> {
        let length = 1 + self.payload.len();

        let mut buf: Vec<u8> = Vec::with_capacity(4 + length);
        buf.extend_from_slice(&(length as u32).to_be_bytes());
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Human-readable message kind, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self.id {
            MESSAGE_CHOKE => "CHOKE",
            MESSAGE_UNCHOKE => "UNCHOKE",
            MESSAGE_INTERESTED => "INTERESTED",
            MESSAGE_NOT_INTERESTED => "NOT_INTERESTED",
            MESSAGE_HAVE => "HAVE",
            MESSAGE_BITFIELD => "BITFIELD",
            MESSAGE_REQUEST => "REQUEST",
            MESSAGE_PIECE => "PIECE",
            MESSAGE_CANCEL => "CANCEL",
            MESSAGE_PORT => "PORT",
            _ => "UNKNOWN",
        }
    }
}

/// Serialize a message, or the four-byte zero keep-alive frame for `None`.
#[allow(dead_code)]
pub fn marshal(message: Option<&Message>) -> Vec<u8> {
    match message {
        Some(message) => message.marshal(),
        None => vec![0; 4],
    }
}

/// Read exactly one frame from `reader`.
///
/// Returns `None` for a keep-alive. Fails if the length prefix cannot be
/// read or if fewer than `length` body bytes follow it.
pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let length = match reader.read_u32::<BigEndian>() {
        Ok(length) => length as usize,
        Err(_) => return Err(anyhow!("could not read message length from peer")),
    };

    // A zero length frame is a keep-alive
    if length == 0 {
        return Ok(None);
    }

    let mut buf: Vec<u8> = vec![0; length];
    if reader.read_exact(&mut buf).is_err() {
        return Err(anyhow!("could not read message body from peer"));
    }

    Ok(Some(Message {
        id: buf[0],
        payload: buf[1..].to_vec(),
    }))
}

/// Extract the piece index from a HAVE message.
pub fn parse_have(message: &Message) -> Result<u32> {
    if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
        return Err(anyhow!("received invalid HAVE message from peer"));
    }

    let mut cursor = Cursor::new(&message.payload);
    Ok(cursor.read_u32::<BigEndian>()?)
}

/// Extract (index, begin, length) from a REQUEST or CANCEL message.
pub fn parse_request(message: &Message) -> Result<(u32, u32, u32)> {
    if message.id != MESSAGE_REQUEST && message.id != MESSAGE_CANCEL {
        return Err(anyhow!("message is not a REQUEST or CANCEL"));
    }
    if message.payload.len() != 12 {
        return Err(anyhow!("received invalid {} message from peer", message.name()));
    }

    let mut cursor = Cursor::new(&message.payload);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;
    let length = cursor.read_u32::<BigEndian>()?;

    Ok((index, begin, length))
}

/// Copy the block carried by a PIECE message into `buf` at its begin
/// offset, returning the number of bytes copied.
///
/// Fails, without touching `buf`, if the payload is shorter than its fixed
/// header, if the frame's piece index is not `index`, or if the block would
/// overflow `buf`.
pub fn parse_piece(index: u32, buf: &mut [u8], message: &Message) -> Result<usize> {
    if message.id != MESSAGE_PIECE || message.payload.len() < 8 {
        return Err(anyhow!("received invalid PIECE message from peer"));
    }

    let mut cursor = Cursor::new(&message.payload[..8]);
    let piece_index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()? as usize;

    if piece_index != index {
        return Err(anyhow!(
            "received piece {} from peer while expecting piece {}",
            piece_index,
            index
        ));
    }

    let block = &message.payload[8..];
    if begin + block.len() > buf.len() {
        return Err(anyhow!("received block overflowing the piece from peer"));
    }

    buf[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len())
}

/// Extract the DHT listen port from a PORT message.
pub fn parse_port(message: &Message) -> Result<u16> {
    if message.id != MESSAGE_PORT || message.payload.len() != 2 {
        return Err(anyhow!("received invalid PORT message from peer"));
    }

    let mut cursor = Cursor::new(&message.payload);
    Ok(cursor.read_u16::<BigEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_sizes() {
        assert_eq!(Message::choke().payload.len(), 0);
        assert_eq!(Message::unchoke().payload.len(), 0);
        assert_eq!(Message::interested().payload.len(), 0);
        assert_eq!(Message::not_interested().payload.len(), 0);
        assert_eq!(Message::have(0).payload.len(), 4);
        assert_eq!(Message::bitfield(vec![1, 2, 3, 4]).payload.len(), 4);
        assert_eq!(Message::request(0, 0, 128).payload.len(), 12);
        assert_eq!(Message::piece(1, 2, &[1, 2, 3, 4]).payload.len(), 12);
        assert_eq!(Message::cancel(1, 2, 128).payload.len(), 12);
        assert_eq!(Message::port(8080).payload.len(), 2);
    }

    #[test]
    fn test_round_trip() {
        let messages = [
            Message::choke(),
            Message::unchoke(),
            Message::interested(),
            Message::not_interested(),
            Message::have(100),
            Message::bitfield(vec![0b10100000, 0b00010010]),
            Message::request(1, 2, 16384),
            Message::piece(1, 2, &[7; 16384]),
            Message::cancel(1, 2, 16384),
            Message::port(8080),
        ];

        for message in messages {
            let buf = message.marshal();
            let decoded = unmarshal(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, Some(message));
        }
    }

    #[test]
    fn test_keep_alive() {
        assert_eq!(marshal(None), vec![0, 0, 0, 0]);
        assert_eq!(unmarshal(&mut [0u8, 0, 0, 0].as_slice()).unwrap(), None);
    }

    #[test]
    fn test_unmarshal_truncated() {
        // Length prefix cut short
        assert!(unmarshal(&mut [0u8, 0].as_slice()).is_err());
        // Body shorter than the announced length
        assert!(unmarshal(&mut [0u8, 0, 0, 5, 4, 0].as_slice()).is_err());
    }

    #[test]
    fn test_parse_have() {
        assert_eq!(parse_have(&Message::have(42)).unwrap(), 42);

        let short = Message {
            id: MESSAGE_HAVE,
            payload: vec![0, 0, 1],
        };
        assert!(parse_have(&short).is_err());
        assert!(parse_have(&Message::choke()).is_err());
    }

    #[test]
    fn test_parse_request() {
        let (index, begin, length) = parse_request(&Message::request(3, 16384, 16384)).unwrap();
        assert_eq!((index, begin, length), (3, 16384, 16384));

        let short = Message {
            id: MESSAGE_REQUEST,
            payload: vec![0; 8],
        };
        assert!(parse_request(&short).is_err());
    }

    #[test]
    fn test_parse_piece() {
        let mut buf = vec![0; 8];
        let copied = parse_piece(7, &mut buf, &Message::piece(7, 2, &[1, 2, 3, 4])).unwrap();

        assert_eq!(copied, 4);
        assert_eq!(buf, vec![0, 0, 1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_parse_piece_wrong_index() {
        let mut buf = vec![0; 8];
        assert!(parse_piece(7, &mut buf, &Message::piece(8, 0, &[1, 2])).is_err());
        assert_eq!(buf, vec![0; 8]);
    }

    #[test]
    fn test_parse_piece_overflowing_block() {
        let mut buf = vec![0; 8];
        assert!(parse_piece(7, &mut buf, &Message::piece(7, 6, &[1, 2, 3, 4])).is_err());
        assert_eq!(buf, vec![0; 8]);
    }

    #[test]
    fn test_parse_piece_short_payload() {
        let mut buf = vec![0; 8];
        let short = Message {
            id: MESSAGE_PIECE,
            payload: vec![0; 7],
        };
        assert!(parse_piece(0, &mut buf, &short).is_err());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port(&Message::port(6881)).unwrap(), 6881);

        let short = Message {
            id: MESSAGE_PORT,
            payload: vec![1],
        };
        assert!(parse_port(&short).is_err());
    }
}
