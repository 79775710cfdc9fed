//! Purpose: Lazily declared publisher handles, one per routing key.
//! Exports: `PublisherCache`.
//! Role: Shared by every `send`; reads are concurrent, declarations are serialized.
//! Invariants: At most one native publisher per key.
//! Invariants: A handle leaves the cache only after its undeclare succeeded.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, error};

use crate::core::error::{Error, ErrorKind};
use crate::core::session::Session;

pub(crate) struct PublisherCache<S: Session> {
    handles: RwLock<HashMap<String, Arc<S::Publisher>>>,
    create_lock: Mutex<()>,
}

impl<S: Session> PublisherCache<S> {
    pub(crate) fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    /// Cached handle for `key`, declaring it on first use.
    ///
    /// Readers never contend with each other; only a miss takes the create lock, and the
    /// map is re-checked under it so concurrent first sends declare once.
    pub(crate) fn get_or_declare(&self, session: &S, key: &str) -> Result<Arc<S::Publisher>, Error> {
        if let Some(handle) = self.lookup(key) {
            return Ok(handle);
        }

        let _create = self
            .create_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = self.lookup(key) {
            return Ok(handle);
        }

        let handle = Arc::new(session.declare_publisher(key).map_err(|err| {
            error!(key, error = %err, "unable to declare publisher");
            err.with_key(key)
        })?);
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), Arc::clone(&handle));
        debug!(key, "publisher declared");
        Ok(handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Undeclares every cached publisher; stops at the first failure, leaving the rest cached.
    pub(crate) fn undeclare_all(&self, session: &S) -> Result<(), Error> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<String> = handles.keys().cloned().collect();
        for key in keys {
            let Some(handle) = handles.get(&key) else {
                continue;
            };
            if Arc::strong_count(handle) > 1 {
                return Err(Error::new(ErrorKind::Internal)
                    .with_message("publisher still in use")
                    .with_key(key));
            }
            if let Err(err) = session.undeclare_publisher(handle) {
                error!(key = %key, error = %err, "undeclare publisher failed");
                return Err(err.with_key(key));
            }
            handles.remove(&key);
            debug!(key = %key, "publisher undeclared");
        }
        Ok(())
    }

    fn lookup(&self, key: &str) -> Option<Arc<S::Publisher>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::PublisherCache;
    use crate::core::error::ErrorKind;
    use crate::local::{Fault, LocalSession};
    use crate::core::session::Session;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn open_session() -> LocalSession {
        let session = LocalSession::new();
        session.open().expect("open");
        session
    }

    #[test]
    fn concurrent_first_use_declares_once() {
        let session = Arc::new(open_session());
        let cache = Arc::new(PublisherCache::<LocalSession>::new());
        let start = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                let cache = Arc::clone(&cache);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    cache.get_or_declare(&session, "up/topic").expect("declare");
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(session.stats().publishers_declared, 1);
    }

    #[test]
    fn failed_declare_caches_nothing() {
        let session = open_session();
        let cache = PublisherCache::<LocalSession>::new();
        session.inject(Fault::DeclarePublisher);
        let err = cache.get_or_declare(&session, "up/a").expect_err("fault");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.key(), Some("up/a"));
        assert_eq!(cache.len(), 0);

        cache.get_or_declare(&session, "up/a").expect("declare");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn undeclare_all_stops_at_first_failure() {
        let session = open_session();
        let cache = PublisherCache::<LocalSession>::new();
        cache.get_or_declare(&session, "up/a").expect("declare");
        cache.get_or_declare(&session, "up/b").expect("declare");

        session.inject(Fault::Undeclare);
        cache.undeclare_all(&session).expect_err("fault");
        assert_eq!(cache.len(), 2);
        assert_eq!(session.stats().live_publishers, 2);

        cache.undeclare_all(&session).expect("undeclare");
        assert_eq!(cache.len(), 0);
        assert_eq!(session.stats().live_publishers, 0);
    }

    #[test]
    fn shared_handle_is_not_undeclared() {
        let session = open_session();
        let cache = PublisherCache::<LocalSession>::new();
        let held = cache.get_or_declare(&session, "up/a").expect("declare");

        let err = cache.undeclare_all(&session).expect_err("in use");
        assert_eq!(err.key(), Some("up/a"));
        assert_eq!(cache.len(), 1);

        drop(held);
        cache.undeclare_all(&session).expect("undeclare");
        assert_eq!(session.stats().live_publishers, 0);
    }
}
