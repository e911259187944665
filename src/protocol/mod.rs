//! MongoDB wire protocol codec: message framing, OP_MSG (kind 0 + kind 1
//! sections), and legacy OP_QUERY/OP_REPLY for handshake compatibility.

use crate::error::{Error, ProtocolError, Result};
use bson::{Bson, Document};
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub const SIZE: usize = 16;

    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            Self::SIZE,
        ))
    }
}

pub const OP_MSG: i32 = 2013;
pub const OP_QUERY: i32 = 2004;
pub const OP_REPLY: i32 = 1;

/// A process-wide monotonically increasing counter used to stamp outgoing
/// `requestId`s.
static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Try to split one complete wire frame off the front of `buf`. Returns the
/// frame's bytes (header included) if a full frame is present, leaving the
/// remainder in `buf`. A single `read()` may deliver a partial frame or
/// several back-to-back frames; callers should loop calling this until it
/// returns `None`.
pub fn try_take_frame(buf: &mut BytesMut) -> Result<Option<BytesMut>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if message_length < MessageHeader::SIZE as i32 {
        return Err(Error::Protocol(ProtocolError::Framing(format!(
            "message length {} below header size",
            message_length
        ))));
    }
    let message_length = message_length as usize;
    if buf.len() < message_length {
        return Ok(None);
    }
    Ok(Some(buf.split_to(message_length)))
}

/// A decoded OP_MSG: the merged command body and whether the checksum flag
/// was set (the checksum bytes themselves are validated structurally, not
/// verified against a CRC).
pub struct OpMsg {
    pub body: Document,
    pub checksum_present: bool,
}

/// Decode a complete OP_MSG frame (header included) into a merged command
/// document. Kind-0 contributes the base body; kind-1 sections are merged in
/// as arrays keyed by their identifier.
pub fn decode_op_msg(frame: &[u8]) -> Result<OpMsg> {
    let (header, header_len) = MessageHeader::parse(frame)
        .ok_or_else(|| Error::Protocol(ProtocolError::Framing("frame shorter than header".into())))?;
    if header.op_code != OP_MSG {
        return Err(Error::Protocol(ProtocolError::UnsupportedOpcode(header.op_code)));
    }

    let body_region = &frame[header_len..];
    if body_region.len() < 4 {
        return Err(Error::Protocol(ProtocolError::Framing(
            "OP_MSG body missing flagBits".into(),
        )));
    }
    let flags = u32::from_le_bytes([body_region[0], body_region[1], body_region[2], body_region[3]]);
    let checksum_present = flags & 1 != 0;

    let payload_limit = if checksum_present {
        frame.len().saturating_sub(4)
    } else {
        frame.len()
    };
    if checksum_present && frame.len() < 4 {
        return Err(Error::Protocol(ProtocolError::Framing(
            "flagBit0 set but checksum bytes absent".into(),
        )));
    }

    let mut offset = header_len + 4;
    let mut body: Option<Document> = None;

    while offset < payload_limit {
        let kind = frame[offset];
        offset += 1;
        match kind {
            0 => {
                let mut cursor = std::io::Cursor::new(&frame[offset..payload_limit]);
                let doc = Document::from_reader(&mut cursor)
                    .map_err(|e| Error::Protocol(ProtocolError::Framing(format!("bad kind-0 section: {e}"))))?;
                offset += cursor.position() as usize;
                body = Some(doc);
            }
            1 => {
                if offset + 4 > payload_limit {
                    return Err(Error::Protocol(ProtocolError::Framing(
                        "truncated kind-1 section size".into(),
                    )));
                }
                let section_size = u32::from_le_bytes([
                    frame[offset],
                    frame[offset + 1],
                    frame[offset + 2],
                    frame[offset + 3],
                ]) as usize;
                let section_start = offset;
                let section_end = section_start + section_size;
                if section_size < 4 || section_end > payload_limit {
                    return Err(Error::Protocol(ProtocolError::Framing(
                        "kind-1 section size out of range".into(),
                    )));
                }
                let mut cur = section_start + 4;
                let ident_end = frame[cur..section_end]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| Error::Protocol(ProtocolError::Framing("unterminated kind-1 identifier".into())))?
                    + cur;
                let identifier = std::str::from_utf8(&frame[cur..ident_end])
                    .map_err(|_| Error::Protocol(ProtocolError::Framing("non-utf8 kind-1 identifier".into())))?
                    .to_string();
                cur = ident_end + 1;

                let mut docs = Vec::new();
                while cur < section_end {
                    let mut cursor = std::io::Cursor::new(&frame[cur..section_end]);
                    let doc = Document::from_reader(&mut cursor).map_err(|e| {
                        Error::Protocol(ProtocolError::Framing(format!("bad kind-1 document: {e}")))
                    })?;
                    cur += cursor.position() as usize;
                    docs.push(Bson::Document(doc));
                }

                let base = body.get_or_insert_with(Document::new);
                match base.get_mut(&identifier) {
                    Some(Bson::Array(existing)) => existing.extend(docs),
                    Some(_) => {
                        return Err(Error::Protocol(ProtocolError::Framing(format!(
                            "kind-1 identifier '{identifier}' collides with a non-array field"
                        ))));
                    }
                    None => {
                        base.insert(identifier, Bson::Array(docs));
                    }
                }
                offset = section_end;
            }
            other => return Err(Error::Protocol(ProtocolError::UnsupportedSectionKind(other))),
        }
    }

    let body = body.ok_or_else(|| Error::Protocol(ProtocolError::Framing("OP_MSG missing kind-0 section".into())))?;
    Ok(OpMsg { body, checksum_present })
}

/// Encode an OP_MSG with a single kind-0 section containing `doc`. Never
/// emits kind-1 sections or a checksum.
pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    let doc_bytes = bson::to_vec(doc)?;
    let flags: u32 = 0;
    let body_len = 4 + 1 + doc_bytes.len();
    let message_length = MessageHeader::SIZE + body_len;

    let mut out = Vec::with_capacity(message_length);
    out.extend_from_slice(&(message_length as i32).to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&OP_MSG.to_le_bytes());

    out.extend_from_slice(&flags.to_le_bytes());
    out.push(0u8);
    out.extend_from_slice(&doc_bytes);
    Ok(out)
}

/// Decode OP_QUERY body into (flags, fullCollectionName, numberToSkip, numberToReturn, queryDoc).
pub fn decode_op_query(body: &[u8]) -> Result<(u32, String, i32, i32, Document)> {
    if body.len() < 4 {
        return Err(Error::Protocol(ProtocolError::Framing("OP_QUERY body too short".into())));
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let mut i = 4;
    let end = body[i..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol(ProtocolError::Framing("unterminated OP_QUERY collection name".into())))?
        + i;
    let full_collection_name = std::str::from_utf8(&body[i..end])
        .map_err(|_| Error::Protocol(ProtocolError::Framing("non-utf8 collection name".into())))?
        .to_string();
    i = end + 1;
    if i + 8 > body.len() {
        return Err(Error::Protocol(ProtocolError::Framing("OP_QUERY missing skip/limit".into())));
    }
    let number_to_skip = i32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
    i += 4;
    let number_to_return = i32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
    i += 4;
    let query_bytes = &body[i..];
    let mut cursor = std::io::Cursor::new(query_bytes);
    let doc = Document::from_reader(&mut cursor)
        .map_err(|e| Error::Protocol(ProtocolError::Framing(format!("bad OP_QUERY document: {e}"))))?;
    Ok((flags, full_collection_name, number_to_skip, number_to_return, doc))
}

/// Encode OP_REPLY with a single returned document, zero cursorId.
pub fn encode_op_reply(doc: &Document, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    let response_flags: u32 = 0;
    let cursor_id: i64 = 0;
    let starting_from: i32 = 0;
    let number_returned: i32 = 1;

    let doc_bytes = bson::to_vec(doc)?;
    let body_len = 4 + 8 + 4 + 4 + doc_bytes.len();
    let message_length = MessageHeader::SIZE + body_len;

    let mut out = Vec::with_capacity(message_length);
    out.extend_from_slice(&(message_length as i32).to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&OP_REPLY.to_le_bytes());

    out.extend_from_slice(&response_flags.to_le_bytes());
    out.extend_from_slice(&cursor_id.to_le_bytes());
    out.extend_from_slice(&starting_from.to_le_bytes());
    out.extend_from_slice(&number_returned.to_le_bytes());
    out.extend_from_slice(&doc_bytes);
    Ok(out)
}
