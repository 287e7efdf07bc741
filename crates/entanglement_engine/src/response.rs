//! Response correlation.
//!
//! A [`ResponseContext`] travels with an incoming message through the
//! flood rule and into outgoing dirty items. It collects the local futures
//! waiting for an outcome and the (connection, counter) pairs that a peer
//! is waiting on. Once nothing can respond any more, every waiter is told
//! so: local futures resolve to `None` and peers receive `_no_resp_for`.

use crate::error::SyncResult;
use crate::object::SyncObject;
use entanglement_protocol::DestHash;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Outcome delivered to response futures. `Ok(None)` means no response.
pub type ResponseOutcome = SyncResult<Option<SyncObject>>;

/// A connection that can be told no response is coming for some of its
/// incoming counters.
pub(crate) trait NoResponseSink: Send + Sync {
    /// Identity of the connection, unique per manager.
    fn connection_id(&self) -> u64;
    /// Peer the connection talks to.
    fn dest_hash(&self) -> DestHash;
    /// Queues `_no_resp_for` for the given incoming counters.
    fn no_response(&self, counters: Vec<u32>);
}

type Callback = Box<dyn FnOnce(&ResponseOutcome) + Send>;

struct CompletionState {
    sender: Option<oneshot::Sender<ResponseOutcome>>,
    callbacks: Vec<Callback>,
    done: bool,
}

/// The producing half of a [`ResponseFuture`], shareable between a response
/// context and a transition record.
#[derive(Clone)]
pub(crate) struct Completion(Arc<Mutex<CompletionState>>);

impl Completion {
    pub(crate) fn new() -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        let state = CompletionState {
            sender: Some(tx),
            callbacks: Vec::new(),
            done: false,
        };
        (Self(Arc::new(Mutex::new(state))), ResponseFuture { rx })
    }

    /// Registers a callback that runs once the outcome is known.
    ///
    /// Callbacks run on the runtime after the completing call returns, so
    /// they may take locks the completer holds.
    pub(crate) fn on_complete(&self, callback: impl FnOnce(&ResponseOutcome) + Send + 'static) {
        self.0.lock().callbacks.push(Box::new(callback));
    }

    /// Delivers the outcome. Returns false if it was already delivered.
    pub(crate) fn complete(&self, outcome: ResponseOutcome) -> bool {
        let (sender, callbacks) = {
            let mut state = self.0.lock();
            if state.done {
                return false;
            }
            state.done = true;
            (state.sender.take(), std::mem::take(&mut state.callbacks))
        };
        if !callbacks.is_empty() {
            let shared = outcome.clone();
            let run = move || {
                for callback in callbacks {
                    callback(&shared);
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { run() });
                }
                Err(_) => run(),
            }
        }
        if let Some(sender) = sender {
            // The waiter may have stopped listening.
            let _ = sender.send(outcome);
        }
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        self.0.lock().done
    }

    pub(crate) fn ptr_eq(&self, other: &Completion) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Resolves when the peer that ends up handling an object responds.
///
/// Yields `Ok(Some(object))` for a successful response, `Ok(None)` when it
/// becomes known that no response will come, or the peer's error.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<ResponseOutcome>,
}

impl ResponseFuture {
    /// A future that already holds its outcome.
    pub(crate) fn ready(outcome: ResponseOutcome) -> Self {
        let (completion, future) = Completion::new();
        completion.complete(outcome);
        future
    }

    /// Returns the outcome if it has already arrived.
    pub fn try_outcome(&mut self) -> Option<ResponseOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Ok(None)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = ResponseOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Completion dropped without an outcome: nothing will respond.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(None)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Forward {
    sink: Weak<dyn NoResponseSink>,
    connection_id: u64,
    counters: Vec<u32>,
}

struct ContextState {
    futures: Vec<Completion>,
    forwards: Vec<Forward>,
    no_response_yet: bool,
}

impl ContextState {
    fn take_all(&mut self) -> (Vec<Completion>, Vec<Forward>) {
        (
            std::mem::take(&mut self.futures),
            std::mem::take(&mut self.forwards),
        )
    }
}

fn notify_no_response(futures: Vec<Completion>, forwards: Vec<Forward>) {
    for future in futures {
        future.complete(Ok(None));
    }
    for forward in forwards {
        if let Some(sink) = forward.sink.upgrade() {
            sink.no_response(forward.counters);
        }
    }
}

impl Drop for ContextState {
    fn drop(&mut self) {
        let (futures, forwards) = self.take_all();
        notify_no_response(futures, forwards);
    }
}

/// Correlates an object in flight with whoever waits for its outcome.
///
/// Clones share state. Dropping the last clone behaves like
/// [`ResponseContext::no_response`].
#[derive(Clone)]
pub struct ResponseContext(Arc<Mutex<ContextState>>);

impl Default for ResponseContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseContext {
    /// Creates an empty context that has not seen a response yet.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(ContextState {
            futures: Vec::new(),
            forwards: Vec::new(),
            no_response_yet: true,
        })))
    }

    /// Creates the context for a frame that arrived with `RESPONSE_NEEDED`.
    pub(crate) fn for_incoming(sink: Weak<dyn NoResponseSink>, connection_id: u64, counter: u32) -> Self {
        let ctx = Self::new();
        ctx.0.lock().forwards.push(Forward {
            sink,
            connection_id,
            counters: vec![counter],
        });
        ctx
    }

    /// Adds a local waiter.
    pub fn add_future(&self) -> ResponseFuture {
        let (completion, future) = Completion::new();
        self.add_completion(completion);
        future
    }

    pub(crate) fn add_completion(&self, completion: Completion) {
        self.0.lock().futures.push(completion);
    }

    /// True until a response path has been established.
    pub fn no_response_yet(&self) -> bool {
        self.0.lock().no_response_yet
    }

    pub(crate) fn mark_responded(&self) {
        self.0.lock().no_response_yet = false;
    }

    /// Returns true if some peer is waiting on this context.
    pub(crate) fn has_forwards(&self) -> bool {
        !self.0.lock().forwards.is_empty()
    }

    /// Notes the destinations an object is about to be sent to.
    ///
    /// Sending toward a peer that waits on this context is itself the
    /// response, so no further response is requested.
    pub(crate) fn sending_to(&self, dests: &[DestHash]) {
        let mut state = self.0.lock();
        let responding = state.forwards.iter().any(|forward| {
            forward
                .sink
                .upgrade()
                .map(|sink| dests.contains(&sink.dest_hash()))
                .unwrap_or(false)
        });
        if responding {
            state.no_response_yet = false;
        }
    }

    /// Removes and returns the counters owed to one connection.
    pub(crate) fn responses_to(&self, connection_id: u64) -> Option<Vec<u32>> {
        let mut state = self.0.lock();
        let mut counters = Vec::new();
        state.forwards.retain_mut(|forward| {
            if forward.connection_id == connection_id {
                counters.append(&mut forward.counters);
                false
            } else {
                true
            }
        });
        if counters.is_empty() {
            None
        } else {
            Some(counters)
        }
    }

    /// Delivers an outcome to every local waiter.
    ///
    /// Ignored while no response path exists, so a local incoming hook
    /// does not count as the response to its own message.
    pub(crate) fn resolve(&self, outcome: ResponseOutcome) {
        let futures = {
            let mut state = self.0.lock();
            if state.no_response_yet {
                return;
            }
            std::mem::take(&mut state.futures)
        };
        for future in futures {
            future.complete(outcome.clone());
        }
    }

    /// Declares that no response will come.
    pub fn no_response(&self) {
        let (futures, forwards) = {
            let mut state = self.0.lock();
            state.no_response_yet = false;
            state.take_all()
        };
        notify_no_response(futures, forwards);
    }

    /// Moves the other context's waiters into this one.
    pub(crate) fn merge(&self, other: &ResponseContext) {
        if self.ptr_eq(other) {
            return;
        }
        let (futures, forwards) = other.0.lock().take_all();
        let mut state = self.0.lock();
        state.futures.extend(futures);
        for forward in forwards {
            match state
                .forwards
                .iter_mut()
                .find(|f| f.connection_id == forward.connection_id)
            {
                Some(existing) => existing.counters.extend(forward.counters),
                None => state.forwards.push(forward),
            }
        }
    }

    /// Returns true if the completion is one of the local waiters.
    pub(crate) fn holds(&self, completion: &Completion) -> bool {
        self.0.lock().futures.iter().any(|held| held.ptr_eq(completion))
    }

    /// Returns true if both handles share state.
    pub fn ptr_eq(&self, other: &ResponseContext) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Destinations of the peers waiting on this context.
    pub(crate) fn forward_destinations(&self) -> Vec<DestHash> {
        self.0
            .lock()
            .forwards
            .iter()
            .filter_map(|forward| forward.sink.upgrade())
            .map(|sink| sink.dest_hash())
            .collect()
    }
}

impl fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock();
        f.debug_struct("ResponseContext")
            .field("futures", &state.futures.len())
            .field("forwards", &state.forwards.len())
            .field("no_response_yet", &state.no_response_yet)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::object::PrimaryKey;
    use serde_json::Map;

    struct RecordingSink {
        id: u64,
        dest: DestHash,
        seen: Mutex<Vec<Vec<u32>>>,
    }

    impl RecordingSink {
        fn new(id: u64, name: &str) -> Arc<Self> {
            Arc::new(Self {
                id,
                dest: DestHash::from_string(name),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl NoResponseSink for RecordingSink {
        fn connection_id(&self) -> u64 {
            self.id
        }
        fn dest_hash(&self) -> DestHash {
            self.dest
        }
        fn no_response(&self, counters: Vec<u32>) {
            self.seen.lock().push(counters);
        }
    }

    fn weak(sink: &Arc<RecordingSink>) -> Weak<dyn NoResponseSink> {
        let sink: Arc<dyn NoResponseSink> = sink.clone();
        Arc::downgrade(&sink)
    }

    fn object() -> SyncObject {
        SyncObject::new("Widget", PrimaryKey::Values("[1]".into()), Map::new())
    }

    #[test]
    fn resolve_ignored_until_response_path_exists() {
        let ctx = ResponseContext::new();
        let mut fut = ctx.add_future();

        ctx.resolve(Ok(Some(object())));
        assert!(fut.try_outcome().is_none());

        ctx.mark_responded();
        ctx.resolve(Err(SyncError::BadOwner("x".into())));
        assert_eq!(fut.try_outcome(), Some(Err(SyncError::BadOwner("x".into()))));
    }

    #[test]
    fn no_response_notifies_futures_and_peers() {
        let sink = RecordingSink::new(1, "a");
        let ctx = ResponseContext::for_incoming(weak(&sink), 1, 7);
        let mut fut = ctx.add_future();

        ctx.no_response();
        assert_eq!(fut.try_outcome(), Some(Ok(None)));
        assert_eq!(*sink.seen.lock(), vec![vec![7]]);

        // Second call has nothing left to notify
        ctx.no_response();
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[test]
    fn dropping_last_clone_means_no_response() {
        let sink = RecordingSink::new(1, "a");
        let ctx = ResponseContext::for_incoming(weak(&sink), 1, 3);
        let mut fut = ctx.add_future();
        let clone = ctx.clone();

        drop(ctx);
        assert!(sink.seen.lock().is_empty());
        drop(clone);
        assert_eq!(*sink.seen.lock(), vec![vec![3]]);
        assert_eq!(fut.try_outcome(), Some(Ok(None)));
    }

    #[test]
    fn sending_back_to_waiting_peer_is_the_response() {
        let sink = RecordingSink::new(1, "a");
        let ctx = ResponseContext::for_incoming(weak(&sink), 1, 0);

        ctx.sending_to(&[DestHash::from_string("b")]);
        assert!(ctx.no_response_yet());
        ctx.sending_to(&[DestHash::from_string("a")]);
        assert!(!ctx.no_response_yet());
    }

    #[test]
    fn responses_to_pops_counters() {
        let a = RecordingSink::new(1, "a");
        let b = RecordingSink::new(2, "b");
        let ctx = ResponseContext::for_incoming(weak(&a), 1, 4);
        ctx.merge(&ResponseContext::for_incoming(weak(&a), 1, 5));
        ctx.merge(&ResponseContext::for_incoming(weak(&b), 2, 9));

        assert_eq!(ctx.responses_to(1), Some(vec![4, 5]));
        assert_eq!(ctx.responses_to(1), None);
        assert_eq!(ctx.forward_destinations(), vec![b.dest]);

        // Counters consumed by a send are not reported again on drop
        drop(ctx);
        assert!(a.seen.lock().is_empty());
        assert_eq!(*b.seen.lock(), vec![vec![9]]);
    }

    #[test]
    fn merge_moves_waiters() {
        let target = ResponseContext::new();
        let source = ResponseContext::new();
        let mut fut = source.add_future();

        target.merge(&source);
        drop(source);
        assert!(fut.try_outcome().is_none());

        target.mark_responded();
        target.resolve(Ok(Some(object())));
        assert_eq!(fut.try_outcome(), Some(Ok(Some(object()))));
    }

    #[test]
    fn holds_tracks_added_completions() {
        let ctx = ResponseContext::new();
        let (completion, _fut) = Completion::new();
        let (other, _other_fut) = Completion::new();
        ctx.add_completion(completion.clone());
        assert!(ctx.holds(&completion));
        assert!(!ctx.holds(&other));
    }

    #[test]
    fn completion_delivers_once() {
        let (completion, mut fut) = Completion::new();
        assert!(completion.complete(Ok(None)));
        assert!(!completion.complete(Err(SyncError::Closed)));
        assert_eq!(fut.try_outcome(), Some(Ok(None)));
    }

    #[tokio::test]
    async fn completion_callbacks_run_on_runtime() {
        let (completion, fut) = Completion::new();
        let (tx, rx) = oneshot::channel();
        completion.on_complete(move |outcome| {
            let _ = tx.send(outcome.is_err());
        });

        completion.complete(Err(SyncError::Closed));
        assert_eq!(fut.await, Err(SyncError::Closed));
        assert!(rx.await.unwrap());
    }
}
