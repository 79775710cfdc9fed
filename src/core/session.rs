//! Purpose: Network substrate seam: publish, subscribe, queryable, and reply primitives.
//! Exports: `Session`, `Encoding`, `Attachment`, `PutOptions`, `Sample`, `InboundQuery`,
//! `Callbacks`, `CloseCallback`, `HEADER_ATTACHMENT`.
//! Role: Implemented by substrate bindings; the engine only talks to this trait.
//! Invariants: Event callbacks run on substrate-owned threads, never the declaring caller's.
//! Invariants: `on_close` runs at most once per declaration, at undeclare or session close.
//! Invariants: A failed undeclare leaves the declaration live; the handle can be retried.
use bytes::Bytes;

use crate::core::error::{Error, ErrorKind};
use crate::core::message::SerializationHint;

/// Attachment entry carrying the encoded attribute blob.
pub const HEADER_ATTACHMENT: &str = "header";

/// Substrate payload encoding tags.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Encoding {
    Protobuf,
    Json,
    TextPlain,
    OctetStream,
    Raw,
}

impl Encoding {
    /// Encoding for a declared hint; an absent hint is plain text.
    pub fn from_hint(hint: Option<SerializationHint>) -> Result<Self, Error> {
        match hint {
            None | Some(SerializationHint::Text) => Ok(Encoding::TextPlain),
            Some(SerializationHint::Protobuf | SerializationHint::ProtobufWrappedInAny) => {
                Ok(Encoding::Protobuf)
            }
            Some(SerializationHint::Json) => Ok(Encoding::Json),
            Some(SerializationHint::SomeIp | SerializationHint::SomeIpTlv) => {
                Ok(Encoding::OctetStream)
            }
            Some(SerializationHint::Raw) => Ok(Encoding::Raw),
            Some(SerializationHint::Unknown) => Err(Error::new(ErrorKind::Internal)
                .with_message("serialization hint has no substrate encoding")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Protobuf => "application/protobuf",
            Encoding::Json => "application/json",
            Encoding::TextPlain => "text/plain",
            Encoding::OctetStream => "application/octet-stream",
            Encoding::Raw => "zenoh/bytes",
        }
    }
}

/// Named out-of-band byte blobs travelling alongside a payload.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Attachment {
    entries: Vec<(String, Bytes)>,
}

impl Attachment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PutOptions {
    pub encoding: Encoding,
    pub attachment: Attachment,
}

impl PutOptions {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            attachment: Attachment::new(),
        }
    }

    /// Options carrying `header` as the attribute attachment.
    pub fn with_header(encoding: Encoding, header: impl Into<Bytes>) -> Self {
        let mut options = Self::new(encoding);
        options.attachment.insert(HEADER_ATTACHMENT, header);
        options
    }
}

/// Inbound publication delivered to a subscriber.
#[derive(Clone, Debug)]
pub struct Sample {
    pub key: String,
    pub payload: Bytes,
    pub encoding: Encoding,
    pub attachment: Option<Attachment>,
}

/// Inbound query delivered to a queryable; owns the handle used to reply.
#[derive(Debug)]
pub struct InboundQuery<Q> {
    pub key: String,
    pub payload: Bytes,
    pub encoding: Encoding,
    pub attachment: Option<Attachment>,
    pub handle: Q,
}

pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Event and close handlers handed to the substrate at declaration time.
pub struct Callbacks<T> {
    pub on_event: Box<dyn Fn(T) + Send + Sync>,
    pub on_close: CloseCallback,
}

impl<T> Callbacks<T> {
    pub fn new(
        on_event: impl Fn(T) + Send + Sync + 'static,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            on_event: Box::new(on_event),
            on_close: Box::new(on_close),
        }
    }
}

pub trait Session: Send + Sync + 'static {
    type Publisher: Send + Sync + 'static;
    type Subscriber: Send + 'static;
    type Queryable: Send + 'static;
    type Query: Send + 'static;

    fn open(&self) -> Result<(), Error>;
    fn close(&self) -> Result<(), Error>;

    fn declare_publisher(&self, key: &str) -> Result<Self::Publisher, Error>;
    /// Retires `publisher`; the caller drops the handle only after this succeeds.
    fn undeclare_publisher(&self, publisher: &Self::Publisher) -> Result<(), Error>;
    fn put(
        &self,
        publisher: &Self::Publisher,
        payload: &[u8],
        options: PutOptions,
    ) -> Result<(), Error>;

    fn declare_subscriber(
        &self,
        key: &str,
        callbacks: Callbacks<Sample>,
    ) -> Result<Self::Subscriber, Error>;
    fn undeclare_subscriber(&self, subscriber: &Self::Subscriber) -> Result<(), Error>;

    fn declare_queryable(
        &self,
        key: &str,
        callbacks: Callbacks<InboundQuery<Self::Query>>,
    ) -> Result<Self::Queryable, Error>;
    fn undeclare_queryable(&self, queryable: &Self::Queryable) -> Result<(), Error>;

    /// Answers `query`; the handle stays owned by the caller until it is dropped.
    fn reply(&self, query: &Self::Query, payload: &[u8], options: PutOptions)
    -> Result<(), Error>;
}
