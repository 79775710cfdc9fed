//! Purpose: Define the stable public Rust API boundary for ulink.
//! Exports: `UTransport` and the value types, collaborator traits, and errors it needs.
//! Role: Public, additive-only surface; hides the registries behind the transport handle.
//! Invariants: Registries, drain, and dispatch internals are never exposed directly.
//! Invariants: Substrate implementations only need items re-exported here.

mod dispatch;
mod drain;
mod pending;
mod publisher;
mod registry;
mod transport;

pub use crate::core::codec::{AttributeCodec, TlvCodec};
pub use crate::core::config::TransportConfig;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, to_ucode};
pub use crate::core::message::{
    MessageType, Payload, PayloadMode, Priority, SerializationHint, UAttributes, UMessage,
};
pub use crate::core::resolver::{HashedKeyResolver, KeyResolver};
pub use crate::core::session::{
    Attachment, Callbacks, CloseCallback, Encoding, HEADER_ATTACHMENT, InboundQuery, PutOptions,
    Sample, Session,
};
pub use crate::core::uri::{UResource, UUri};
pub use registry::Listener;
pub use transport::{ApiResult, Phase, TransportBuilder, TransportStats, UTransport};
