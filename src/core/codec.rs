//! Purpose: Encode message attributes into one opaque blob carried out of band.
//! Exports: `AttributeCodec`, `TlvCodec`.
//! Role: Used by the transport on every send and inbound delivery.
//! Invariants: `decode(encode(a)) == a`; attributes that cannot round-trip fail to encode.
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};
use crate::core::message::{MessageType, Priority, SerializationHint, UAttributes};
use crate::core::uri::UUri;

pub trait AttributeCodec: Send + Sync {
    fn encode(&self, attributes: &UAttributes) -> Result<Vec<u8>, Error>;
    fn decode(&self, bytes: &[u8]) -> Result<UAttributes, Error>;
}

const TAG_ID: u8 = 1;
const TAG_TYPE: u8 = 2;
const TAG_SOURCE: u8 = 3;
const TAG_SINK: u8 = 4;
const TAG_PRIORITY: u8 = 5;
const TAG_TTL: u8 = 6;
const TAG_REQID: u8 = 7;
const TAG_HINT: u8 = 8;

const TLV_HEADER_LEN: usize = 3;

/// Tag/length/value codec: `tag: u8, len: u16 LE, value`, one record per present field.
#[derive(Clone, Copy, Debug, Default)]
pub struct TlvCodec;

impl AttributeCodec for TlvCodec {
    fn encode(&self, attributes: &UAttributes) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(64);
        write_tlv(&mut buf, TAG_ID, attributes.id.as_bytes())?;
        write_tlv(&mut buf, TAG_TYPE, &[attributes.message_type as u8])?;
        if let Some(source) = &attributes.source {
            write_tlv(&mut buf, TAG_SOURCE, source.to_long_form()?.as_bytes())?;
        }
        if let Some(sink) = &attributes.sink {
            write_tlv(&mut buf, TAG_SINK, sink.to_long_form()?.as_bytes())?;
        }
        if let Some(priority) = attributes.priority {
            write_tlv(&mut buf, TAG_PRIORITY, &[priority as u8])?;
        }
        if let Some(ttl) = attributes.ttl {
            write_tlv(&mut buf, TAG_TTL, &ttl.to_le_bytes())?;
        }
        if let Some(reqid) = &attributes.reqid {
            write_tlv(&mut buf, TAG_REQID, reqid.as_bytes())?;
        }
        if let Some(hint) = attributes.serialization_hint {
            write_tlv(&mut buf, TAG_HINT, &[hint as u8])?;
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<UAttributes, Error> {
        let mut id = None;
        let mut message_type = None;
        let mut source = None;
        let mut sink = None;
        let mut priority = None;
        let mut ttl = None;
        let mut reqid = None;
        let mut serialization_hint = None;

        let mut offset = 0;
        while offset < bytes.len() {
            let (tag, value, next) = read_tlv(bytes, offset)?;
            match tag {
                TAG_ID => id = Some(read_uuid(value)?),
                TAG_TYPE => message_type = Some(MessageType::from_u8(read_byte(value)?)?),
                TAG_SOURCE => source = Some(read_uri(value)?),
                TAG_SINK => sink = Some(read_uri(value)?),
                TAG_PRIORITY => priority = Some(Priority::from_u8(read_byte(value)?)?),
                TAG_TTL => ttl = Some(read_u32(value)?),
                TAG_REQID => reqid = Some(read_uuid(value)?),
                TAG_HINT => {
                    serialization_hint = Some(SerializationHint::from_u8(read_byte(value)?)?)
                }
                _ => {}
            }
            offset = next;
        }

        let id = id.ok_or_else(|| corrupt("missing message id"))?;
        let message_type = message_type.ok_or_else(|| corrupt("missing message type"))?;
        Ok(UAttributes {
            id,
            message_type,
            source,
            sink,
            priority,
            ttl,
            reqid,
            serialization_hint,
        })
    }
}

fn write_tlv(buf: &mut Vec<u8>, tag: u8, value: &[u8]) -> Result<(), Error> {
    let len = u16::try_from(value.len()).map_err(|_| {
        Error::new(ErrorKind::Internal).with_message(format!("attribute {tag} exceeds 65535 bytes"))
    })?;
    buf.push(tag);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

fn read_tlv(buf: &[u8], offset: usize) -> Result<(u8, &[u8], usize), Error> {
    if buf.len() - offset < TLV_HEADER_LEN {
        return Err(corrupt("truncated attribute header"));
    }
    let tag = buf[offset];
    let len = u16::from_le_bytes([buf[offset + 1], buf[offset + 2]]) as usize;
    let start = offset + TLV_HEADER_LEN;
    let end = start + len;
    if end > buf.len() {
        return Err(corrupt("truncated attribute value"));
    }
    Ok((tag, &buf[start..end], end))
}

fn read_byte(value: &[u8]) -> Result<u8, Error> {
    match value {
        [byte] => Ok(*byte),
        _ => Err(corrupt("expected one byte")),
    }
}

fn read_u32(value: &[u8]) -> Result<u32, Error> {
    let raw: [u8; 4] = value.try_into().map_err(|_| corrupt("expected four bytes"))?;
    Ok(u32::from_le_bytes(raw))
}

fn read_uuid(value: &[u8]) -> Result<Uuid, Error> {
    Uuid::from_slice(value).map_err(|err| corrupt("invalid uuid").with_source(err))
}

fn read_uri(value: &[u8]) -> Result<UUri, Error> {
    let text = std::str::from_utf8(value).map_err(|err| corrupt("address is not utf-8").with_source(err))?;
    UUri::parse(text).map_err(|err| corrupt("invalid address").with_source(err))
}

fn corrupt(message: &str) -> Error {
    Error::new(ErrorKind::Internal).with_message(message)
}
