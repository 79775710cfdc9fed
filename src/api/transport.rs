//! Purpose: Bind the message model onto a `Session` substrate.
//! Exports: `UTransport`, `TransportBuilder`, `TransportStats`, `Phase`.
//! Role: Entry point for applications; owns the session and every registry.
//! Invariants: The session is opened on the first `init` and closed only by a completed teardown.
//! Invariants: Sends and registrations enter the in-flight counter before checking the phase.
//! Invariants: After a completed `term`, no native declaration made by this transport remains.
#![allow(clippy::result_large_err)]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::dispatch::{ListenerContext, push_callbacks, request_callbacks};
use crate::api::drain::{DrainOutcome, InFlight};
use crate::api::pending::PendingRequests;
use crate::api::publisher::PublisherCache;
use crate::api::registry::{Listener, ListenerRegistry, Registration};
use crate::core::codec::{AttributeCodec, TlvCodec};
use crate::core::config::TransportConfig;
use crate::core::error::{Error, ErrorKind};
use crate::core::message::{MessageType, UAttributes, UMessage};
use crate::core::resolver::{HashedKeyResolver, KeyResolver};
use crate::core::session::{Encoding, PutOptions, Session};
use crate::core::uri::UUri;

pub type ApiResult<T> = Result<T, Error>;

/// Where the transport sits in its init/term cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Phase {
    /// Session closed; only `init` is meaningful.
    Closed,
    /// At least one user; sends and registrations are accepted.
    Running,
    /// Last user left but teardown did not complete; the session is still open.
    Stalled,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Running,
            2 => Phase::Stalled,
            _ => Phase::Closed,
        }
    }
}

/// Point-in-time counters, read without blocking senders.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct TransportStats {
    pub phase: Phase,
    pub users: usize,
    pub publishers: usize,
    pub listeners: usize,
    pub pending_requests: usize,
    pub in_flight: usize,
    pub terminating: bool,
}

pub(crate) struct Shared<S: Session> {
    session: S,
    resolver: Box<dyn KeyResolver>,
    pub(crate) codec: Box<dyn AttributeCodec>,
    config: TransportConfig,
    /// Serializes `init` and `term`; held across the whole teardown.
    lifecycle: Mutex<()>,
    phase: AtomicU8,
    users: AtomicUsize,
    terminating: AtomicBool,
    in_flight: InFlight,
    publishers: PublisherCache<S>,
    listeners: ListenerRegistry<S>,
    pub(crate) pending: PendingRequests<S::Query>,
}

impl<S: Session> Shared<S> {
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> ApiResult<()> {
        if self.users.load(Ordering::SeqCst) == 0 {
            return Err(Error::new(ErrorKind::Unavailable).with_message("transport not initialized"));
        }
        if self.is_terminating() {
            return Err(Error::new(ErrorKind::Unavailable).with_message("transport terminating"));
        }
        Ok(())
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn resolve(&self, address: &UUri) -> ApiResult<String> {
        self.resolver.resolve(address).map_err(|err| {
            Error::new(ErrorKind::InvalidArgument)
                .with_message(format!("unable to resolve address {address}"))
                .with_source(err)
        })
    }

    fn put_options(&self, attributes: &UAttributes) -> ApiResult<PutOptions> {
        let encoding = Encoding::from_hint(attributes.serialization_hint)?;
        let header = self.codec.encode(attributes)?;
        Ok(PutOptions::with_header(encoding, header))
    }

    /// Drain, undeclare, and close; any failure leaves the remaining steps for a retry.
    fn teardown(&self) -> ApiResult<()> {
        self.terminating.store(true, Ordering::SeqCst);

        let timeout = self.config.drain_timeout();
        if self.in_flight.wait_idle(timeout) == DrainOutcome::TimedOut {
            let in_flight = self.in_flight.current();
            warn!(in_flight, timeout_ms = self.config.drain_timeout_ms, "drain timed out");
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("{in_flight} operations still in flight after drain timeout")));
        }

        self.publishers.undeclare_all(&self.session)?;
        self.listeners.undeclare_all(&self.session)?;
        let dropped = self.pending.clear();
        if dropped > 0 {
            warn!(dropped, "unanswered requests dropped at teardown");
        }
        self.session.close().map_err(|err| {
            error!(error = %err, "session close failed");
            err
        })?;
        info!("session closed");
        Ok(())
    }
}

/// Configures collaborators before the transport is built.
pub struct TransportBuilder<S: Session> {
    session: S,
    config: TransportConfig,
    resolver: Option<Box<dyn KeyResolver>>,
    codec: Option<Box<dyn AttributeCodec>>,
}

impl<S: Session> TransportBuilder<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            config: TransportConfig::default(),
            resolver: None,
            codec: None,
        }
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the default `HashedKeyResolver` built from the configured prefix.
    pub fn resolver(mut self, resolver: impl KeyResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn codec(mut self, codec: impl AttributeCodec + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    pub fn build(self) -> ApiResult<UTransport<S>> {
        self.config.validate()?;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Box::new(HashedKeyResolver::new(self.config.key_prefix.clone())));
        let codec = self.codec.unwrap_or_else(|| Box::new(TlvCodec));
        let pending = PendingRequests::new(self.config.max_pending_requests);
        Ok(UTransport {
            shared: Arc::new(Shared {
                session: self.session,
                resolver,
                codec,
                config: self.config,
                lifecycle: Mutex::new(()),
                phase: AtomicU8::new(Phase::Closed as u8),
                users: AtomicUsize::new(0),
                terminating: AtomicBool::new(false),
                in_flight: InFlight::new(),
                publishers: PublisherCache::new(),
                listeners: ListenerRegistry::new(),
                pending,
            }),
        })
    }
}

/// Cloneable handle to one transport; clones share the session and every registry.
pub struct UTransport<S: Session> {
    shared: Arc<Shared<S>>,
}

impl<S: Session> Clone for UTransport<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Session> fmt::Debug for UTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UTransport")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<S: Session> UTransport<S> {
    /// Transport with the default resolver, codec, and config.
    pub fn new(session: S) -> ApiResult<Self> {
        TransportBuilder::new(session).build()
    }

    pub fn builder(session: S) -> TransportBuilder<S> {
        TransportBuilder::new(session)
    }

    /// Adds a user; the first one opens the session.
    pub fn init(&self) -> ApiResult<()> {
        let shared = &self.shared;
        let _lifecycle = shared.lock_lifecycle();
        match shared.phase() {
            Phase::Closed => {
                shared.session.open().map_err(|err| {
                    error!(error = %err, "session open failed");
                    err
                })?;
                shared.terminating.store(false, Ordering::SeqCst);
                shared.set_phase(Phase::Running);
                info!("session opened");
            }
            Phase::Stalled => {
                shared.terminating.store(false, Ordering::SeqCst);
                shared.set_phase(Phase::Running);
                info!("resuming after incomplete teardown");
            }
            Phase::Running => {}
        }
        let users = shared.users.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(users, "transport user added");
        Ok(())
    }

    /// Drops a user; the last one tears everything down.
    ///
    /// A failed teardown leaves the transport `Stalled`: calling `term` again retries the
    /// remaining steps, and calling `init` resumes with the still-open session.
    pub fn term(&self) -> ApiResult<()> {
        let shared = &self.shared;
        let _lifecycle = shared.lock_lifecycle();
        match shared.phase() {
            Phase::Closed => {
                return Err(Error::new(ErrorKind::Unavailable).with_message("transport not initialized"));
            }
            Phase::Running => {
                let users = shared.users.fetch_sub(1, Ordering::SeqCst) - 1;
                if users > 0 {
                    debug!(users, "transport user removed");
                    return Ok(());
                }
                shared.set_phase(Phase::Stalled);
            }
            Phase::Stalled => info!("retrying teardown"),
        }
        shared.teardown()?;
        shared.set_phase(Phase::Closed);
        Ok(())
    }

    /// Routes `message` by type: publications to their topic, responses to the waiting query.
    pub fn send(&self, message: &UMessage) -> ApiResult<()> {
        let _in_flight = self.shared.in_flight.enter();
        self.shared.ensure_accepting()?;
        match message.message_type() {
            MessageType::Publish => self.publish(message),
            MessageType::Response => self.respond(message),
            MessageType::Request => Err(Error::new(ErrorKind::InvalidArgument)
                .with_message("outbound requests are not supported")
                .with_id(message.id())),
        }
    }

    fn publish(&self, message: &UMessage) -> ApiResult<()> {
        let shared = &self.shared;
        let attributes = &message.attributes;
        let topic = attributes.source.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument)
                .with_message("publication has no source topic")
                .with_id(attributes.id)
        })?;
        let key = shared.resolve(topic)?;
        let options = shared
            .put_options(attributes)
            .map_err(|err| err.with_key(&key).with_id(attributes.id))?;
        let publisher = shared.publishers.get_or_declare(&shared.session, &key)?;

        shared
            .session
            .put(&publisher, message.payload.as_bytes(), options)
            .map_err(|err| {
                error!(key = %key, id = %attributes.id, error = %err, "put failed");
                err.with_key(&key).with_id(attributes.id)
            })?;
        debug!(key = %key, id = %attributes.id, bytes = message.payload.len(), "published");
        Ok(())
    }

    fn respond(&self, message: &UMessage) -> ApiResult<()> {
        let shared = &self.shared;
        let attributes = &message.attributes;
        let reqid = attributes.reqid.ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument)
                .with_message("response has no request id")
                .with_id(attributes.id)
        })?;

        shared.pending.reply_with(&reqid, |query| {
            let options = shared.put_options(attributes)?;
            shared
                .session
                .reply(query, message.payload.as_bytes(), options)
                .map_err(|err| {
                    error!(id = %reqid, error = %err, "reply failed");
                    err
                })
        })
    }

    /// Binds `listener` to `address`; RPC method addresses receive requests, anything else
    /// receives publications.
    pub fn register_listener(&self, address: &UUri, listener: Arc<dyn Listener>) -> ApiResult<()> {
        let shared = &self.shared;
        let _in_flight = shared.in_flight.enter();
        shared.ensure_accepting()?;
        let key = shared.resolve(address)?;
        let rpc = address.is_rpc_method();

        shared.listeners.register(&key, &listener, || {
            let context = ListenerContext::new(
                address.clone(),
                Arc::downgrade(shared),
                Arc::clone(&listener),
            );
            if rpc {
                shared
                    .session
                    .declare_queryable(&key, request_callbacks(context))
                    .map(Registration::RequestReply)
            } else {
                shared
                    .session
                    .declare_subscriber(&key, push_callbacks(context))
                    .map(Registration::Push)
            }
        })?;
        info!(key = %key, address = %address, rpc, "listener registered");
        Ok(())
    }

    pub fn unregister_listener(&self, address: &UUri, listener: &Arc<dyn Listener>) -> ApiResult<()> {
        let shared = &self.shared;
        let _in_flight = shared.in_flight.enter();
        shared.ensure_accepting()?;
        let key = shared.resolve(address)?;
        shared.listeners.unregister(&shared.session, &key, listener)?;
        debug!(key = %key, address = %address, "listener unregistered");
        Ok(())
    }

    /// Never waits on `init` or `term`, so it is safe to call from a listener during teardown.
    pub fn stats(&self) -> TransportStats {
        let shared = &self.shared;
        TransportStats {
            phase: shared.phase(),
            users: shared.users.load(Ordering::SeqCst),
            publishers: shared.publishers.len(),
            listeners: shared.listeners.len(),
            pending_requests: shared.pending.len(),
            in_flight: shared.in_flight.current(),
            terminating: shared.is_terminating(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// The substrate this transport drives.
    pub fn session(&self) -> &S {
        &self.shared.session
    }

    /// Routing key `address` resolves to.
    pub fn resolve(&self, address: &UUri) -> ApiResult<String> {
        self.shared.resolve(address)
    }
}
