//! Purpose: Turn substrate deliveries into messages and hand them to listeners.
//! Exports: `ListenerContext`, `CallbackContext`, `push_callbacks`, `request_callbacks`.
//! Role: Runs on substrate-owned threads; never on the thread that registered.
//! Invariants: A context is released exactly once, by the declaration's close callback.
//! Invariants: A request's query handle is stored before its listener sees the message.
//! Invariants: Nothing is delivered once the transport is terminating.
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, error, warn};

use crate::api::registry::Listener;
use crate::api::transport::Shared;
use crate::core::codec::AttributeCodec;
use crate::core::error::{Error, ErrorKind};
use crate::core::message::{MessageType, Payload, UAttributes, UMessage};
use crate::core::session::{Attachment, Callbacks, HEADER_ATTACHMENT, InboundQuery, Sample, Session};
use crate::core::uri::UUri;

/// Everything a delivery needs: the registered address, the transport, the listener.
pub(crate) struct ListenerContext<S: Session> {
    address: UUri,
    transport: Weak<Shared<S>>,
    listener: Arc<dyn Listener>,
}

impl<S: Session> ListenerContext<S> {
    pub(crate) fn new(address: UUri, transport: Weak<Shared<S>>, listener: Arc<dyn Listener>) -> Self {
        Self {
            address,
            transport,
            listener,
        }
    }
}

/// Slot shared by a declaration's event and close callbacks.
///
/// Deliveries borrow the context through a cloned `Arc`, so a delivery still running when
/// the close callback fires keeps it alive until it returns.
pub(crate) struct CallbackContext<S: Session> {
    slot: Mutex<Option<Arc<ListenerContext<S>>>>,
}

impl<S: Session> CallbackContext<S> {
    pub(crate) fn new(context: ListenerContext<S>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Some(Arc::new(context))),
        })
    }

    fn current(&self) -> Option<Arc<ListenerContext<S>>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drops the context; returns `false` when it was already released.
    pub(crate) fn release(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

pub(crate) fn push_callbacks<S: Session>(context: ListenerContext<S>) -> Callbacks<Sample> {
    let slot = CallbackContext::new(context);
    let closing = Arc::clone(&slot);
    Callbacks::new(
        move |sample: Sample| match slot.current() {
            Some(context) => deliver_sample(&context, sample),
            None => debug!(key = %sample.key, "sample after close discarded"),
        },
        move || on_close(&closing),
    )
}

pub(crate) fn request_callbacks<S: Session>(
    context: ListenerContext<S>,
) -> Callbacks<InboundQuery<S::Query>> {
    let slot = CallbackContext::new(context);
    let closing = Arc::clone(&slot);
    Callbacks::new(
        move |query: InboundQuery<S::Query>| match slot.current() {
            Some(context) => deliver_query(&context, query),
            None => debug!(key = %query.key, "query after close discarded"),
        },
        move || on_close(&closing),
    )
}

fn on_close<S: Session>(slot: &CallbackContext<S>) {
    if !slot.release() {
        error!("callback context already released");
    }
}

fn deliver_sample<S: Session>(context: &ListenerContext<S>, sample: Sample) {
    let Some(shared) = context.transport.upgrade() else {
        debug!(key = %sample.key, "transport dropped; sample discarded");
        return;
    };
    if shared.is_terminating() {
        debug!(key = %sample.key, "transport terminating; sample discarded");
        return;
    }

    let attributes = match decode_header(shared.codec.as_ref(), sample.attachment.as_ref()) {
        Ok(attributes) => attributes,
        Err(err) => {
            error!(key = %sample.key, error = %err, "dropping sample with unreadable attributes");
            return;
        }
    };

    let message = UMessage::new(attributes, Payload::reference(sample.payload));
    if let Err(err) = context.listener.on_receive(message) {
        warn!(address = %context.address, error = %err, "listener failed to handle publication");
    }
}

fn deliver_query<S: Session>(context: &ListenerContext<S>, query: InboundQuery<S::Query>) {
    let Some(shared) = context.transport.upgrade() else {
        debug!(key = %query.key, "transport dropped; query discarded");
        return;
    };
    if shared.is_terminating() {
        debug!(key = %query.key, "transport terminating; query discarded");
        return;
    }

    let attributes = match decode_header(shared.codec.as_ref(), query.attachment.as_ref()) {
        Ok(attributes) => attributes,
        Err(err) => {
            error!(key = %query.key, error = %err, "dropping query with unreadable attributes");
            return;
        }
    };
    if attributes.message_type != MessageType::Request {
        error!(
            key = %query.key,
            message_type = attributes.message_type.as_str(),
            "wrong message type on queryable"
        );
        return;
    }

    let InboundQuery {
        key,
        payload,
        handle,
        ..
    } = query;
    let id = attributes.id;
    if let Err((err, _unanswered)) = shared.pending.insert(id, handle) {
        warn!(key = %key, id = %id, error = %err, "request dropped");
        return;
    }
    debug!(key = %key, id = %id, "request stored");

    let message = UMessage::new(attributes, Payload::reference(payload));
    if let Err(err) = context.listener.on_receive(message) {
        warn!(address = %context.address, id = %id, error = %err, "listener failed to handle request");
    }
}

fn decode_header(
    codec: &dyn AttributeCodec,
    attachment: Option<&Attachment>,
) -> Result<UAttributes, Error> {
    let header = attachment
        .and_then(|attachment| attachment.get(HEADER_ATTACHMENT))
        .filter(|header| !header.is_empty())
        .ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("attribute attachment not found")
        })?;
    codec.decode(header)
}

#[cfg(test)]
mod tests {
    use super::{CallbackContext, ListenerContext, decode_header};
    use crate::api::registry::Listener;
    use crate::core::codec::{AttributeCodec, TlvCodec};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::message::{UAttributes, UMessage};
    use crate::core::session::{Attachment, HEADER_ATTACHMENT};
    use crate::core::uri::UUri;
    use crate::local::LocalSession;
    use std::sync::{Arc, Weak};

    #[test]
    fn release_happens_once_and_frees_listener() {
        let listener: Arc<dyn Listener> =
            Arc::new(|_message: UMessage| -> Result<(), Error> { Ok(()) });
        let context = ListenerContext::<LocalSession>::new(
            UUri::topic("body", 1, "door", None, None),
            Weak::new(),
            Arc::clone(&listener),
        );
        let slot = CallbackContext::new(context);
        assert_eq!(Arc::strong_count(&listener), 2);

        assert!(slot.release());
        assert!(!slot.release());
        assert_eq!(Arc::strong_count(&listener), 1);
    }

    #[test]
    fn header_is_required() {
        let err = decode_header(&TlvCodec, None).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Internal);

        let mut attachment = Attachment::new();
        attachment.insert("other", vec![1]);
        assert!(decode_header(&TlvCodec, Some(&attachment)).is_err());

        let attributes = UAttributes::publish(UUri::topic("body", 1, "door", None, None));
        attachment.insert(HEADER_ATTACHMENT, TlvCodec.encode(&attributes).expect("encode"));
        let decoded = decode_header(&TlvCodec, Some(&attachment)).expect("decode");
        assert_eq!(decoded, attributes);
    }
}
