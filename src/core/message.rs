//! Purpose: Message envelope carried through the transport.
//! Exports: `UMessage`, `UAttributes`, `MessageType`, `Priority`, `SerializationHint`,
//! `Payload`, `PayloadMode`.
//! Role: Value types only; classification and routing live in `api`.
//! Invariants: Every message carries a unique id; responses carry the request id as `reqid`.
use bytes::Bytes;
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};
use crate::core::uri::UUri;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MessageType {
    Publish = 1,
    Request = 2,
    Response = 3,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(MessageType::Publish),
            2 => Ok(MessageType::Request),
            3 => Ok(MessageType::Response),
            _ => Err(Error::new(ErrorKind::Internal)
                .with_message(format!("invalid message type {value}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Publish => "pub.v1",
            MessageType::Request => "req.v1",
            MessageType::Response => "res.v1",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    Cs0 = 0,
    Cs1 = 1,
    Cs2 = 2,
    Cs3 = 3,
    Cs4 = 4,
    Cs5 = 5,
    Cs6 = 6,
}

impl Priority {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Priority::Cs0),
            1 => Ok(Priority::Cs1),
            2 => Ok(Priority::Cs2),
            3 => Ok(Priority::Cs3),
            4 => Ok(Priority::Cs4),
            5 => Ok(Priority::Cs5),
            6 => Ok(Priority::Cs6),
            _ => Err(Error::new(ErrorKind::Internal)
                .with_message(format!("invalid priority {value}"))),
        }
    }
}

/// How the payload bytes were serialized by the sender.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SerializationHint {
    Unknown = 0,
    Protobuf = 1,
    ProtobufWrappedInAny = 2,
    Json = 3,
    SomeIp = 4,
    SomeIpTlv = 5,
    Raw = 6,
    Text = 7,
}

impl SerializationHint {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(SerializationHint::Unknown),
            1 => Ok(SerializationHint::Protobuf),
            2 => Ok(SerializationHint::ProtobufWrappedInAny),
            3 => Ok(SerializationHint::Json),
            4 => Ok(SerializationHint::SomeIp),
            5 => Ok(SerializationHint::SomeIpTlv),
            6 => Ok(SerializationHint::Raw),
            7 => Ok(SerializationHint::Text),
            _ => Err(Error::new(ErrorKind::Internal)
                .with_message(format!("invalid serialization hint {value}"))),
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.to_ascii_lowercase().as_str() {
            "unknown" => Ok(SerializationHint::Unknown),
            "protobuf" => Ok(SerializationHint::Protobuf),
            "protobuf-any" => Ok(SerializationHint::ProtobufWrappedInAny),
            "json" => Ok(SerializationHint::Json),
            "someip" => Ok(SerializationHint::SomeIp),
            "someip-tlv" => Ok(SerializationHint::SomeIpTlv),
            "raw" => Ok(SerializationHint::Raw),
            "text" => Ok(SerializationHint::Text),
            _ => Err(Error::new(ErrorKind::InvalidArgument)
                .with_message(format!("unknown serialization hint {value:?}"))),
        }
    }
}

/// Ownership of payload bytes as handed to the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadMode {
    /// Bytes owned by the message.
    Owned,
    /// Bytes borrowed from static storage.
    Borrowed,
    /// View into a buffer owned by the substrate (inbound deliveries).
    Reference,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payload {
    data: Bytes,
    mode: PayloadMode,
}

impl Payload {
    pub fn owned(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Bytes::from(data.into()),
            mode: PayloadMode::Owned,
        }
    }

    pub fn borrowed(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
            mode: PayloadMode::Borrowed,
        }
    }

    pub fn reference(data: Bytes) -> Self {
        Self {
            data,
            mode: PayloadMode::Reference,
        }
    }

    pub fn empty() -> Self {
        Self::borrowed(&[])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UAttributes {
    pub id: Uuid,
    pub message_type: MessageType,
    pub source: Option<UUri>,
    pub sink: Option<UUri>,
    pub priority: Option<Priority>,
    pub ttl: Option<u32>,
    pub reqid: Option<Uuid>,
    pub serialization_hint: Option<SerializationHint>,
}

impl UAttributes {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            source: None,
            sink: None,
            priority: None,
            ttl: None,
            reqid: None,
            serialization_hint: None,
        }
    }

    pub fn publish(topic: UUri) -> Self {
        let mut attributes = Self::new(MessageType::Publish);
        attributes.source = Some(topic);
        attributes
    }

    pub fn request(reply_to: UUri, method: UUri) -> Self {
        let mut attributes = Self::new(MessageType::Request);
        attributes.source = Some(reply_to);
        attributes.sink = Some(method);
        attributes
    }

    /// Response attributes for `request`: addresses swapped, `reqid` set to the request id.
    pub fn response_to(request: &UAttributes) -> Self {
        let mut attributes = Self::new(MessageType::Response);
        attributes.source = request.sink.clone();
        attributes.sink = request.source.clone();
        attributes.reqid = Some(request.id);
        attributes.priority = request.priority;
        attributes
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UMessage {
    pub attributes: UAttributes,
    pub payload: Payload,
}

impl UMessage {
    pub fn new(attributes: UAttributes, payload: Payload) -> Self {
        Self {
            attributes,
            payload,
        }
    }

    pub fn publish(topic: UUri, payload: Payload) -> Self {
        Self::new(UAttributes::publish(topic), payload)
    }

    pub fn request(reply_to: UUri, method: UUri, payload: Payload) -> Self {
        Self::new(UAttributes::request(reply_to, method), payload)
    }

    pub fn response_to(request: &UMessage, payload: Payload) -> Self {
        Self::new(UAttributes::response_to(&request.attributes), payload)
    }

    pub fn with_hint(mut self, hint: SerializationHint) -> Self {
        self.attributes.serialization_hint = Some(hint);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.attributes.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u32) -> Self {
        self.attributes.ttl = Some(ttl_ms);
        self
    }

    pub fn id(&self) -> Uuid {
        self.attributes.id
    }

    pub fn message_type(&self) -> MessageType {
        self.attributes.message_type
    }
}
