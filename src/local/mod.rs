//! Purpose: In-process loopback `Session` used by the CLI, integration tests, and embedders.
//! Exports: `LocalSession`, handle types, `Reply`, `Fault`, `LocalStats`.
//! Role: Reference substrate; routes by exact key match inside one process.
//! Invariants: Event callbacks run on one worker thread, in enqueue order, never on the caller.
//! Invariants: Each declaration's `on_close` runs once, at undeclare or session close.
//! Invariants: Injected faults are one-shot and fail the next matching operation only.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::core::error::{Error, ErrorKind};
use crate::core::session::{
    Attachment, Callbacks, CloseCallback, Encoding, InboundQuery, PutOptions, Sample, Session,
};

type Job = Box<dyn FnOnce() + Send>;
type SampleHandler = Arc<dyn Fn(Sample) + Send + Sync>;
type QueryHandler = Arc<dyn Fn(InboundQuery<LocalQuery>) + Send + Sync>;

/// Operation that fails once after `LocalSession::inject`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    Open,
    DeclarePublisher,
    Put,
    DeclareSubscriber,
    DeclareQueryable,
    Reply,
    /// Any undeclare: publisher, subscriber, or queryable.
    Undeclare,
    Close,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocalStats {
    /// Publisher declarations over the session's lifetime.
    pub publishers_declared: usize,
    pub puts: usize,
    pub replies: usize,
    pub live_publishers: usize,
    pub live_subscribers: usize,
    pub live_queryables: usize,
}

#[derive(Debug)]
pub struct LocalPublisher {
    id: u64,
    key: String,
}

impl LocalPublisher {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
pub struct LocalSubscriber {
    id: u64,
}

#[derive(Debug)]
pub struct LocalQueryable {
    id: u64,
}

/// Query handle; replies travel back to the `get` caller's receiver.
#[derive(Debug)]
pub struct LocalQuery {
    key: String,
    replies: mpsc::Sender<Reply>,
}

impl LocalQuery {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone, Debug)]
pub struct Reply {
    pub payload: Bytes,
    pub encoding: Encoding,
    pub attachment: Attachment,
}

struct Subscription<H> {
    key: String,
    on_event: H,
    on_close: Option<CloseCallback>,
}

impl<T: 'static> Subscription<Arc<dyn Fn(T) + Send + Sync>> {
    fn new(key: &str, callbacks: Callbacks<T>) -> Self {
        Self {
            key: key.to_string(),
            on_event: Arc::from(callbacks.on_event),
            on_close: Some(callbacks.on_close),
        }
    }
}

struct Worker {
    jobs: mpsc::Sender<Job>,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
}

impl Worker {
    fn spawn() -> Result<Self, Error> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name("ulink-local".to_string())
            .spawn(move || {
                for job in queue {
                    job();
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start loopback worker")
                    .with_source(err)
            })?;
        let thread_id = thread.thread().id();
        Ok(Self {
            jobs,
            thread,
            thread_id,
        })
    }

    fn enqueue(&self, job: Job) -> Result<(), Error> {
        self.jobs.send(job).map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("loopback worker stopped")
        })
    }

    /// Stops after queued jobs ran; joining from the worker itself would deadlock.
    fn shutdown(self) {
        let Worker {
            jobs,
            thread,
            thread_id,
        } = self;
        drop(jobs);
        if thread::current().id() == thread_id {
            return;
        }
        if thread.join().is_err() {
            debug!("loopback worker panicked");
        }
    }
}

#[derive(Default)]
struct State {
    worker: Option<Worker>,
    publishers: HashSet<u64>,
    subscribers: HashMap<u64, Subscription<SampleHandler>>,
    queryables: HashMap<u64, Subscription<QueryHandler>>,
}

impl State {
    fn worker(&self) -> Result<&Worker, Error> {
        self.worker
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Unavailable).with_message("session not open"))
    }

    /// Detaches every declaration, returning their close callbacks.
    fn detach_all(&mut self) -> Vec<CloseCallback> {
        self.publishers.clear();
        let subscribers = self.subscribers.drain().map(|(_, entry)| entry.on_close);
        let queryables = self.queryables.drain().map(|(_, entry)| entry.on_close);
        subscribers.chain(queryables).flatten().collect()
    }
}

#[derive(Default)]
pub struct LocalSession {
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
    put_delay: Mutex<Duration>,
    next_id: AtomicU64,
    publishers_declared: AtomicUsize,
    puts: AtomicUsize,
    replies: AtomicUsize,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next operation of this kind fail with an Internal error.
    pub fn inject(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fault);
    }

    /// Stalls every `put` on the calling thread before delivery.
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn is_open(&self) -> bool {
        self.lock_state().worker.is_some()
    }

    pub fn stats(&self) -> LocalStats {
        let state = self.lock_state();
        LocalStats {
            publishers_declared: self.publishers_declared.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            live_publishers: state.publishers.len(),
            live_subscribers: state.subscribers.len(),
            live_queryables: state.queryables.len(),
        }
    }

    /// Sends a query to every queryable declared on `key`.
    ///
    /// The receiver yields one `Reply` per answer and disconnects once every delivered
    /// query handle has been dropped.
    pub fn get(
        &self,
        key: &str,
        payload: &[u8],
        options: PutOptions,
    ) -> Result<mpsc::Receiver<Reply>, Error> {
        let (replies, receiver) = mpsc::channel();
        let state = self.lock_state();
        let worker = state.worker()?;
        let payload = Bytes::copy_from_slice(payload);
        for entry in state.queryables.values().filter(|entry| entry.key == key) {
            let on_event = Arc::clone(&entry.on_event);
            let query = InboundQuery {
                key: key.to_string(),
                payload: payload.clone(),
                encoding: options.encoding,
                attachment: Some(options.attachment.clone()),
                handle: LocalQuery {
                    key: key.to_string(),
                    replies: replies.clone(),
                },
            };
            worker.enqueue(Box::new(move || on_event(query)))?;
        }
        trace!(key, "query routed");
        Ok(receiver)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn fail_if(&self, fault: Fault) -> Result<(), Error> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        match faults.iter().position(|pending| *pending == fault) {
            Some(index) => {
                faults.remove(index);
                Err(Error::new(ErrorKind::Internal).with_message(format!("injected fault: {fault:?}")))
            }
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_declared(what: &str) -> Error {
        Error::new(ErrorKind::Internal).with_message(format!("{what} not declared"))
    }
}

impl Session for LocalSession {
    type Publisher = LocalPublisher;
    type Subscriber = LocalSubscriber;
    type Queryable = LocalQueryable;
    type Query = LocalQuery;

    fn open(&self) -> Result<(), Error> {
        self.fail_if(Fault::Open)?;
        let mut state = self.lock_state();
        if state.worker.is_none() {
            state.worker = Some(Worker::spawn()?);
            debug!("loopback session opened");
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.fail_if(Fault::Close)?;
        let (worker, closing) = {
            let mut state = self.lock_state();
            let worker = state.worker.take().ok_or_else(|| {
                Error::new(ErrorKind::Unavailable).with_message("session not open")
            })?;
            (worker, state.detach_all())
        };
        for on_close in closing {
            on_close();
        }
        worker.shutdown();
        debug!("loopback session closed");
        Ok(())
    }

    fn declare_publisher(&self, key: &str) -> Result<Self::Publisher, Error> {
        self.fail_if(Fault::DeclarePublisher)?;
        let mut state = self.lock_state();
        state.worker()?;
        let id = self.next_id();
        state.publishers.insert(id);
        self.publishers_declared.fetch_add(1, Ordering::Relaxed);
        Ok(LocalPublisher {
            id,
            key: key.to_string(),
        })
    }

    fn undeclare_publisher(&self, publisher: &Self::Publisher) -> Result<(), Error> {
        self.fail_if(Fault::Undeclare)?;
        if self.lock_state().publishers.remove(&publisher.id) {
            Ok(())
        } else {
            Err(Self::not_declared("publisher").with_key(&publisher.key))
        }
    }

    fn put(
        &self,
        publisher: &Self::Publisher,
        payload: &[u8],
        options: PutOptions,
    ) -> Result<(), Error> {
        self.fail_if(Fault::Put)?;
        let delay = *self.put_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let state = self.lock_state();
        let worker = state.worker()?;
        if !state.publishers.contains(&publisher.id) {
            return Err(Self::not_declared("publisher").with_key(&publisher.key));
        }
        let sample = Sample {
            key: publisher.key.clone(),
            payload: Bytes::copy_from_slice(payload),
            encoding: options.encoding,
            attachment: Some(options.attachment),
        };
        for entry in state
            .subscribers
            .values()
            .filter(|entry| entry.key == publisher.key)
        {
            let on_event = Arc::clone(&entry.on_event);
            let sample = sample.clone();
            worker.enqueue(Box::new(move || on_event(sample)))?;
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        trace!(key = %publisher.key, bytes = payload.len(), "put routed");
        Ok(())
    }

    fn declare_subscriber(
        &self,
        key: &str,
        callbacks: Callbacks<Sample>,
    ) -> Result<Self::Subscriber, Error> {
        self.fail_if(Fault::DeclareSubscriber)?;
        let mut state = self.lock_state();
        state.worker()?;
        let id = self.next_id();
        state.subscribers.insert(id, Subscription::new(key, callbacks));
        Ok(LocalSubscriber { id })
    }

    fn undeclare_subscriber(&self, subscriber: &Self::Subscriber) -> Result<(), Error> {
        self.fail_if(Fault::Undeclare)?;
        let entry = self.lock_state().subscribers.remove(&subscriber.id);
        let entry = entry.ok_or_else(|| Self::not_declared("subscriber"))?;
        if let Some(on_close) = entry.on_close {
            on_close();
        }
        Ok(())
    }

    fn declare_queryable(
        &self,
        key: &str,
        callbacks: Callbacks<InboundQuery<Self::Query>>,
    ) -> Result<Self::Queryable, Error> {
        self.fail_if(Fault::DeclareQueryable)?;
        let mut state = self.lock_state();
        state.worker()?;
        let id = self.next_id();
        state.queryables.insert(id, Subscription::new(key, callbacks));
        Ok(LocalQueryable { id })
    }

    fn undeclare_queryable(&self, queryable: &Self::Queryable) -> Result<(), Error> {
        self.fail_if(Fault::Undeclare)?;
        let entry = self.lock_state().queryables.remove(&queryable.id);
        let entry = entry.ok_or_else(|| Self::not_declared("queryable"))?;
        if let Some(on_close) = entry.on_close {
            on_close();
        }
        Ok(())
    }

    fn reply(&self, query: &Self::Query, payload: &[u8], options: PutOptions) -> Result<(), Error> {
        self.fail_if(Fault::Reply)?;
        self.lock_state().worker()?;
        let reply = Reply {
            payload: Bytes::copy_from_slice(payload),
            encoding: options.encoding,
            attachment: options.attachment,
        };
        if query.replies.send(reply).is_err() {
            debug!(key = %query.key, "querier gone; reply discarded");
        }
        self.replies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let worker = state.worker.take();
        for on_close in state.detach_all() {
            on_close();
        }
        if let Some(worker) = worker {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Fault, LocalSession};
    use crate::core::error::ErrorKind;
    use crate::core::session::{Callbacks, Encoding, InboundQuery, PutOptions, Sample, Session};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn open_session() -> LocalSession {
        let session = LocalSession::new();
        session.open().expect("open");
        session
    }

    #[test]
    fn put_reaches_matching_subscribers_off_thread() {
        let session = open_session();
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        session
            .declare_subscriber(
                "up/a",
                Callbacks::new(
                    move |sample: Sample| {
                        tx.send((sample.payload, thread::current().id() != caller))
                            .expect("send");
                    },
                    || {},
                ),
            )
            .expect("subscribe");
        let publisher = session.declare_publisher("up/a").expect("publisher");
        let other = session.declare_publisher("up/b").expect("publisher");

        session
            .put(&other, b"skip", PutOptions::new(Encoding::Raw))
            .expect("put");
        session
            .put(&publisher, b"hello", PutOptions::new(Encoding::Raw))
            .expect("put");

        let (payload, off_thread) = rx.recv_timeout(WAIT).expect("sample");
        assert_eq!(&payload[..], b"hello");
        assert!(off_thread);
        assert_eq!(session.stats().puts, 2);
    }

    #[test]
    fn undeclare_and_close_run_on_close_once() {
        let session = open_session();
        let closed = Arc::new(AtomicUsize::new(0));
        let declare = |key: &str| {
            let closed = Arc::clone(&closed);
            session
                .declare_subscriber(
                    key,
                    Callbacks::new(
                        |_: Sample| {},
                        move || {
                            closed.fetch_add(1, Ordering::SeqCst);
                        },
                    ),
                )
                .expect("subscribe")
        };
        let first = declare("up/a");
        let _second = declare("up/b");

        session.undeclare_subscriber(&first).expect("undeclare");
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        session.close().expect("close");
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert!(!session.is_open());
        assert_eq!(session.stats().live_subscribers, 0);
    }

    #[test]
    fn query_replies_flow_back_to_getter() {
        let session = Arc::new(open_session());
        let responder = Arc::clone(&session);
        session
            .declare_queryable(
                "up/rpc",
                Callbacks::new(
                    move |query: InboundQuery<super::LocalQuery>| {
                        responder
                            .reply(&query.handle, &query.payload, PutOptions::new(Encoding::Json))
                            .expect("reply");
                    },
                    || {},
                ),
            )
            .expect("queryable");

        let replies = session
            .get("up/rpc", b"{}", PutOptions::new(Encoding::Json))
            .expect("get");
        let reply = replies.recv_timeout(WAIT).expect("reply");
        assert_eq!(&reply.payload[..], b"{}");
        assert_eq!(reply.encoding, Encoding::Json);
        assert!(replies.recv_timeout(WAIT).is_err());
    }

    #[test]
    fn faults_fire_once() {
        let session = LocalSession::new();
        session.inject(Fault::Open);
        let err = session.open().expect_err("fault");
        assert_eq!(err.kind(), ErrorKind::Internal);
        session.open().expect("open");
        assert!(session.is_open());
    }

    #[test]
    fn closed_session_refuses_declarations() {
        let session = LocalSession::new();
        let err = session.declare_publisher("up/a").expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        let err = session.close().expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}
