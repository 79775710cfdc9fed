//! Purpose: Track which listeners are bound to which routing keys.
//! Exports: `Listener`, `Registration`, `ListenerRegistry`.
//! Role: One coarse lock serializes every registration change across all keys.
//! Invariants: At most one entry per (key, listener identity).
//! Invariants: Each entry owns exactly one native declaration, tagged with its kind.
//! Invariants: An entry is removed only after its declaration was undeclared.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::core::error::{Error, ErrorKind};
use crate::core::message::UMessage;
use crate::core::session::Session;

/// Application callback bound to an address.
///
/// Invoked synchronously on a substrate thread. Errors are logged by the transport and
/// otherwise ignored; delivery is at-most-once.
pub trait Listener: Send + Sync {
    fn on_receive(&self, message: UMessage) -> Result<(), Error>;
}

impl<F> Listener for F
where
    F: Fn(UMessage) -> Result<(), Error> + Send + Sync,
{
    fn on_receive(&self, message: UMessage) -> Result<(), Error> {
        self(message)
    }
}

/// Listener identity is the allocation behind the `Arc`, not the vtable.
pub(crate) fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) enum Registration<S: Session> {
    Push(S::Subscriber),
    RequestReply(S::Queryable),
}

impl<S: Session> Registration<S> {
    fn undeclare(&self, session: &S) -> Result<(), Error> {
        match self {
            Registration::Push(subscriber) => session.undeclare_subscriber(subscriber),
            Registration::RequestReply(queryable) => session.undeclare_queryable(queryable),
        }
    }
}

struct ListenerEntry<S: Session> {
    listener: Arc<dyn Listener>,
    registration: Registration<S>,
}

pub(crate) struct ListenerRegistry<S: Session> {
    containers: Mutex<HashMap<String, Vec<ListenerEntry<S>>>>,
}

impl<S: Session> ListenerRegistry<S> {
    pub(crate) fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Binds `listener` to `key`; `declare` runs under the registry lock only when the pair is new.
    pub(crate) fn register<F>(
        &self,
        key: &str,
        listener: &Arc<dyn Listener>,
        declare: F,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Result<Registration<S>, Error>,
    {
        let mut containers = self.lock();
        if let Some(entries) = containers.get(key) {
            if entries
                .iter()
                .any(|entry| same_listener(&entry.listener, listener))
            {
                return Err(Error::new(ErrorKind::InvalidArgument)
                    .with_message("listener already registered")
                    .with_key(key));
            }
        }

        let registration = declare().map_err(|err| err.with_key(key))?;
        containers
            .entry(key.to_string())
            .or_default()
            .push(ListenerEntry {
                listener: Arc::clone(listener),
                registration,
            });
        Ok(())
    }

    /// Undeclares and removes the entry for `listener`; unknown listeners are a no-op.
    ///
    /// A failed undeclare keeps the entry so the caller can retry.
    pub(crate) fn unregister(
        &self,
        session: &S,
        key: &str,
        listener: &Arc<dyn Listener>,
    ) -> Result<(), Error> {
        let mut containers = self.lock();
        let Some(entries) = containers.get_mut(key) else {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_message("no listeners registered")
                .with_key(key));
        };
        let Some(index) = entries
            .iter()
            .position(|entry| same_listener(&entry.listener, listener))
        else {
            debug!(key, "listener not registered; nothing to remove");
            return Ok(());
        };

        entries[index].registration.undeclare(session).map_err(|err| {
            error!(key, error = %err, "undeclare listener failed");
            err.with_key(key)
        })?;
        entries.remove(index);
        if entries.is_empty() {
            containers.remove(key);
        }
        Ok(())
    }

    /// Undeclares every registration; stops at the first failure, leaving the rest registered.
    pub(crate) fn undeclare_all(&self, session: &S) -> Result<(), Error> {
        let mut containers = self.lock();
        let keys: Vec<String> = containers.keys().cloned().collect();
        for key in keys {
            let Some(entries) = containers.get_mut(&key) else {
                continue;
            };
            while let Some(entry) = entries.last() {
                if let Err(err) = entry.registration.undeclare(session) {
                    error!(key = %key, error = %err, "undeclare listener failed");
                    return Err(err.with_key(key));
                }
                entries.pop();
            }
            containers.remove(&key);
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn count_for(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ListenerEntry<S>>>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
