//! Purpose: Correlate outbound responses with the inbound requests awaiting them.
//! Exports: `PendingRequests`.
//! Role: Filled by request dispatch, drained by the response send path.
//! Invariants: An entry is removed only after its reply succeeded; at most one reply per id.
//! Invariants: The table never holds more than `capacity` entries.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};

pub(crate) struct PendingRequests<Q> {
    entries: Mutex<HashMap<Uuid, Q>>,
    capacity: usize,
}

impl<Q> PendingRequests<Q> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Retains `query` under the request id; a full table rejects it and hands it back.
    pub(crate) fn insert(&self, id: Uuid, query: Q) -> Result<(), (Error, Q)> {
        let mut entries = self.lock();
        if !entries.contains_key(&id) && entries.len() >= self.capacity {
            return Err((
                Error::new(ErrorKind::Unavailable)
                    .with_message("pending request table is full")
                    .with_id(id),
                query,
            ));
        }
        if entries.insert(id, query).is_some() {
            warn!(id = %id, "request id reused; previous query dropped");
        }
        Ok(())
    }

    /// Runs `reply` against the query stored for `id`, erasing it only when the reply succeeds.
    ///
    /// The table lock is held for the whole sequence so a second reply for the same id
    /// observes either the entry (and waits) or its absence.
    pub(crate) fn reply_with<F>(&self, id: &Uuid, reply: F) -> Result<(), Error>
    where
        F: FnOnce(&Q) -> Result<(), Error>,
    {
        let mut entries = self.lock();
        let Some(query) = entries.get(id) else {
            return Err(Error::new(ErrorKind::Unavailable)
                .with_message("no pending request")
                .with_id(id));
        };
        reply(query).map_err(|err| err.with_id(id))?;
        entries.remove(id);
        debug!(id = %id, "replied on query");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &Uuid) -> bool {
        self.lock().contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Q>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::PendingRequests;
    use crate::core::error::{Error, ErrorKind};
    use std::cell::Cell;
    use uuid::Uuid;

    #[test]
    fn reply_consumes_entry_once() {
        let table = PendingRequests::new(4);
        let id = Uuid::new_v4();
        table.insert(id, "query").expect("insert");

        let calls = Cell::new(0);
        table
            .reply_with(&id, |query| {
                assert_eq!(*query, "query");
                calls.set(calls.get() + 1);
                Ok(())
            })
            .expect("reply");
        assert!(!table.contains(&id));

        let err = table
            .reply_with(&id, |_| {
                calls.set(calls.get() + 1);
                Ok(())
            })
            .expect_err("second reply");
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn failed_reply_keeps_entry() {
        let table = PendingRequests::new(4);
        let id = Uuid::new_v4();
        table.insert(id, ()).expect("insert");
        let err = table
            .reply_with(&id, |_| {
                Err(Error::new(ErrorKind::Internal).with_message("reply failed"))
            })
            .expect_err("fault");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.id(), Some(id.to_string().as_str()));
        assert!(table.contains(&id));
    }

    #[test]
    fn capacity_is_enforced() {
        let table = PendingRequests::new(2);
        table.insert(Uuid::new_v4(), 1).expect("insert");
        table.insert(Uuid::new_v4(), 2).expect("insert");
        let (err, rejected) = table.insert(Uuid::new_v4(), 3).expect_err("full");
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(rejected, 3);
        assert_eq!(table.len(), 2);
        assert_eq!(table.clear(), 2);
        assert_eq!(table.len(), 0);
    }
}
