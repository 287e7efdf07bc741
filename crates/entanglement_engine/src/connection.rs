//! Protocol engine for one connection.
//!
//! A connection owns two tasks: the send loop pops the dirty queue in
//! priority order and writes one frame per item, and the read loop
//! reassembles frames and hands decoded messages to the manager. Outgoing
//! and incoming frames are counted independently; `_resp_for` and
//! `_no_resp_for` refer to the peer's outgoing counters.
//!
//! ## Drain
//!
//! [`Connection::drain`] resolves once every item enqueued before the call
//! has been written. While a drain is outstanding, new items go to a shadow
//! queue unless they coalesce with an item already waiting, and the shadow
//! is folded back in when the drain completes.

use crate::bandwidth::BandwidthLimiter;
use crate::config::BandwidthConfig;
use crate::dirty::{DirtyItem, DirtyQueue};
use crate::error::{SyncError, SyncResult};
use crate::response::{NoResponseSink, ResponseContext};
use crate::transport::BoxStream;
use bytes::{Bytes, BytesMut};
use entanglement_protocol::{DestHash, Frame, FrameDecoder, SyncMessage, RESPONSE_NEEDED};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

const READ_BUFFER: usize = 16 * 1024;

/// Receives what a connection reads.
pub(crate) trait MessageHandler: Send + Sync {
    /// Processes one decoded message. Errors are reported back to the peer.
    fn receive(
        &self,
        conn: &Arc<Connection>,
        msg: SyncMessage,
        response_for: Option<ResponseContext>,
    ) -> SyncResult<()>;

    /// Sends an error object back over the connection.
    fn send_error(&self, conn: &Arc<Connection>, error: &SyncError, response_for: Option<ResponseContext>);

    /// The connection closed; `error` is why, if it failed.
    fn connection_lost(&self, conn: &Arc<Connection>, error: Option<SyncError>);
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport not yet established.
    Connecting,
    /// Transport up, catch-up handshake in progress.
    Handshake,
    /// Fully connected.
    Active,
    /// A drain is outstanding.
    Draining,
    /// Closed for good.
    Closed,
}

/// Traffic counters of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames written.
    pub frames_sent: u64,
    /// Frames read.
    pub frames_received: u64,
    /// Bytes written, headers included.
    pub bytes_sent: u64,
    /// Bytes read, headers included.
    pub bytes_received: u64,
    /// Items waiting to be written, shadow queue included.
    pub queued: usize,
    /// Writes are held back by the bandwidth budget or the transport.
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainStatus {
    Pending,
    Done,
    Closed,
}

struct ConnState {
    dirty: DirtyQueue,
    /// Items enqueued after an outstanding drain began.
    shadow: Option<DirtyQueue>,
    drain: Option<watch::Sender<DrainStatus>>,
    /// An item has been popped and is being written.
    busy: bool,
    out_counter: u32,
    in_counter: u32,
    /// Outgoing counters that asked for a response.
    expected: HashMap<u32, ResponseContext>,
    /// Incoming counters owed a `_no_resp_for`.
    pending_no_resp: Vec<u32>,
    lifecycle: ConnectionState,
}

/// One frame ready to be written.
struct Prepared {
    item: Option<DirtyItem>,
    counter: u32,
    flags: u32,
    no_resp: Vec<u32>,
}

/// A live connection to one destination.
pub(crate) struct Connection {
    id: u64,
    dest_hash: DestHash,
    name: String,
    state: Mutex<ConnState>,
    closed: AtomicBool,
    wake: Notify,
    limiter: BandwidthLimiter,
    stats: RwLock<ConnectionStats>,
    shutdown: watch::Sender<bool>,
    handler: Weak<dyn MessageHandler>,
    self_ref: Weak<Connection>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        dest_hash: DestHash,
        name: impl Into<String>,
        bandwidth: &BandwidthConfig,
        handler: Weak<dyn MessageHandler>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            id,
            dest_hash,
            name: name.into(),
            state: Mutex::new(ConnState {
                dirty: DirtyQueue::new(),
                shadow: None,
                drain: None,
                busy: false,
                out_counter: 0,
                in_counter: 0,
                expected: HashMap::new(),
                pending_no_resp: Vec::new(),
                lifecycle: ConnectionState::Connecting,
            }),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            limiter: BandwidthLimiter::new(bandwidth),
            stats: RwLock::new(ConnectionStats::default()),
            shutdown,
            handler,
            self_ref: self_ref.clone(),
        })
    }

    /// Starts the send and read loops over `stream`.
    pub(crate) fn start(self: &Arc<Self>, stream: BoxStream) {
        {
            let mut state = self.state.lock();
            if state.lifecycle == ConnectionState::Connecting {
                state.lifecycle = ConnectionState::Handshake;
            }
        }
        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(self.clone().send_loop(writer));
        tokio::spawn(self.clone().read_loop(reader));
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn dest_hash(&self) -> DestHash {
        self.dest_hash
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lifecycle(&self) -> ConnectionState {
        self.state.lock().lifecycle
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.read().clone();
        stats.queued = self.queued();
        stats.paused = self.limiter.should_pause();
        stats
    }

    /// Marks the catch-up handshake as finished.
    pub(crate) fn mark_active(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == ConnectionState::Handshake {
            state.lifecycle = if state.drain.is_some() {
                ConnectionState::Draining
            } else {
                ConnectionState::Active
            };
        }
    }

    /// Holds writes back as if the transport had asked to pause.
    pub(crate) fn pause_writing(&self) {
        self.limiter.pause_transport();
    }

    pub(crate) fn resume_writing(&self) {
        self.limiter.resume_transport();
    }

    /// Number of items waiting to be written.
    pub(crate) fn queued(&self) -> usize {
        let state = self.state.lock();
        state.dirty.len() + state.shadow.as_ref().map_or(0, DirtyQueue::len)
    }

    /// Queues an item for sending.
    pub(crate) fn enqueue(&self, item: DirtyItem) -> SyncResult<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.lifecycle == ConnectionState::Closed {
                return Err(SyncError::Closed);
            }
            match state.shadow.as_mut() {
                Some(shadow) if !state.dirty.contains(&item.key()) => shadow.add_or_replace(item),
                _ => state.dirty.add_or_replace(item),
            }
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Returns a future that resolves once everything enqueued so far has
    /// been written.
    ///
    /// Dropping the future does not cancel the drain.
    pub(crate) fn drain(&self) -> impl Future<Output = SyncResult<()>> + Send + 'static {
        let waiting = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.lifecycle == ConnectionState::Closed {
                Err(SyncError::Closed)
            } else if let Some(drain) = &state.drain {
                // Extend the outstanding drain over everything queued since.
                if let Some(shadow) = state.shadow.as_mut() {
                    state.dirty.absorb(shadow);
                }
                Ok(Some(drain.subscribe()))
            } else if !state.dirty.is_empty() || state.busy {
                let (tx, rx) = watch::channel(DrainStatus::Pending);
                state.drain = Some(tx);
                state.shadow = Some(DirtyQueue::new());
                if state.lifecycle == ConnectionState::Active {
                    state.lifecycle = ConnectionState::Draining;
                }
                Ok(Some(rx))
            } else {
                Ok(None)
            }
        };
        async move {
            match waiting? {
                None => Ok(()),
                Some(mut rx) => match rx.wait_for(|status| *status != DrainStatus::Pending).await {
                    Ok(status) if *status == DrainStatus::Done => Ok(()),
                    _ => Err(SyncError::Closed),
                },
            }
        }
    }

    /// Closes the connection. Later calls do nothing.
    pub(crate) fn close(&self, error: Option<SyncError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (expected, dirty, shadow, drain) = {
            let mut state = self.state.lock();
            state.lifecycle = ConnectionState::Closed;
            state.pending_no_resp.clear();
            (
                std::mem::take(&mut state.expected),
                std::mem::take(&mut state.dirty),
                state.shadow.take(),
                state.drain.take(),
            )
        };
        self.shutdown.send_replace(true);
        self.wake.notify_one();
        if let Some(drain) = drain {
            drain.send_replace(DrainStatus::Closed);
        }
        // Contexts dropped here tell their local waiters nothing is coming.
        drop((expected, dirty, shadow));

        match &error {
            Some(e) => warn!(dest = %self.name, error = %e, "connection lost"),
            None => info!(dest = %self.name, "connection closed"),
        }
        if let (Some(handler), Some(me)) = (self.handler.upgrade(), self.self_ref.upgrade()) {
            handler.connection_lost(&me, error);
        }
    }

    async fn send_loop(self: Arc<Self>, mut writer: WriteHalf<BoxStream>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_closed() {
                break;
            }
            tokio::select! {
                _ = self.limiter.ready() => {}
                _ = shutdown.changed() => break,
            }
            let prepared = match self.prepare_next() {
                Some(prepared) => prepared,
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };
            let resp_for = prepared
                .item
                .as_ref()
                .and_then(|item| item.response_for.as_ref())
                .and_then(|ctx| ctx.responses_to(self.id));

            let bytes = match self.encode(&prepared, resp_for.as_deref()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let sync_type = prepared.item.as_ref().map(|item| item.object.sync_type().to_string());
                    warn!(dest = %self.name, ?sync_type, error = %e, "dropping unsendable object");
                    let mut state = self.state.lock();
                    state.busy = false;
                    state.expected.remove(&prepared.counter);
                    state.pending_no_resp.extend(prepared.no_resp);
                    state.pending_no_resp.extend(resp_for.unwrap_or_default());
                    continue;
                }
            };

            if let Err(e) = writer.write_all(&bytes).await {
                self.close(Some(e.into()));
                break;
            }
            trace!(dest = %self.name, counter = prepared.counter, len = bytes.len(), "frame sent");
            {
                let mut state = self.state.lock();
                state.out_counter = state.out_counter.wrapping_add(1);
                state.busy = false;
            }
            self.limiter.on_bytes_written(bytes.len());
            let mut stats = self.stats.write();
            stats.frames_sent += 1;
            stats.bytes_sent += bytes.len() as u64;
        }
        let _ = writer.shutdown().await;
    }

    /// Pops the next frame to send, finishing a drain once the queue empties.
    fn prepare_next(&self) -> Option<Prepared> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        loop {
            if state.lifecycle == ConnectionState::Closed {
                return None;
            }
            if let Some(item) = state.dirty.pop() {
                let counter = state.out_counter;
                let mut flags = 0;
                if let Some(ctx) = &item.response_for {
                    if ctx.no_response_yet() {
                        flags |= RESPONSE_NEEDED;
                        state.expected.insert(counter, ctx.clone());
                    }
                }
                state.busy = true;
                return Some(Prepared {
                    item: Some(item),
                    counter,
                    flags,
                    no_resp: std::mem::take(&mut state.pending_no_resp),
                });
            }
            if !state.pending_no_resp.is_empty() {
                state.busy = true;
                return Some(Prepared {
                    item: None,
                    counter: state.out_counter,
                    flags: 0,
                    no_resp: std::mem::take(&mut state.pending_no_resp),
                });
            }
            if let Some(drain) = state.drain.take() {
                if let Some(mut shadow) = state.shadow.take() {
                    state.dirty.absorb(&mut shadow);
                }
                if state.lifecycle == ConnectionState::Draining {
                    state.lifecycle = ConnectionState::Active;
                }
                drain.send_replace(DrainStatus::Done);
                continue;
            }
            state.busy = false;
            return None;
        }
    }

    fn encode(&self, prepared: &Prepared, resp_for: Option<&[u32]>) -> SyncResult<Bytes> {
        let mut msg = match &prepared.item {
            Some(item) => {
                let mut msg = SyncMessage::from_map(item.object.wire_attributes(&item.attributes, item.with_serial));
                msg.set_sync_type(item.object.sync_type());
                msg.set_operation(item.operation.name());
                if let Some(owner) = item.object.owner().id() {
                    msg.set_owner(owner);
                }
                if item.is_error {
                    msg.set_is_error();
                }
                msg
            }
            None => SyncMessage::new(),
        };
        if let Some(counters) = resp_for {
            msg.set_resp_for(counters.to_vec());
        }
        if !prepared.no_resp.is_empty() {
            msg.set_no_resp_for(prepared.no_resp.clone());
        }
        let payload = msg.to_vec()?;
        Ok(Frame::new(payload, prepared.flags).encode()?)
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<BoxStream>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::with_capacity(READ_BUFFER);
        loop {
            loop {
                match decoder.decode_one(&mut buf) {
                    Ok(Some(frame)) => {
                        if self.is_closed() {
                            return;
                        }
                        self.handle_frame(frame);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.close(Some(e.into()));
                        return;
                    }
                }
            }
            let read = tokio::select! {
                read = reader.read_buf(&mut buf) => read,
                _ = shutdown.changed() => return,
            };
            match read {
                Ok(0) => {
                    debug!(dest = %self.name, "peer closed the stream");
                    self.close(None);
                    return;
                }
                Ok(n) => self.stats.write().bytes_received += n as u64,
                Err(e) => {
                    self.close(Some(e.into()));
                    return;
                }
            }
        }
    }

    fn sink(&self) -> Weak<dyn NoResponseSink> {
        self.self_ref.clone()
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let counter = {
            let mut state = self.state.lock();
            let counter = state.in_counter;
            state.in_counter = counter.wrapping_add(1);
            counter
        };
        self.stats.write().frames_received += 1;
        trace!(dest = %self.name, counter, len = frame.payload.len(), "frame received");

        let Some(handler) = self.handler.upgrade() else {
            return;
        };
        let incoming_ctx = || {
            frame
                .response_needed()
                .then(|| ResponseContext::for_incoming(self.sink(), self.id, counter))
        };

        let mut msg = match SyncMessage::from_slice(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(dest = %self.name, error = %e, "undecodable frame");
                handler.send_error(self, &e.into(), incoming_ctx());
                return;
            }
        };

        match msg.take_no_resp_for() {
            Ok(Some(counters)) => {
                let contexts: Vec<ResponseContext> = {
                    let mut state = self.state.lock();
                    counters.iter().filter_map(|c| state.expected.remove(c)).collect()
                };
                for ctx in contexts {
                    ctx.no_response();
                }
            }
            Ok(None) => {}
            Err(e) => {
                handler.send_error(self, &e.into(), incoming_ctx());
                return;
            }
        }
        if msg.is_meta_only() {
            return;
        }

        let mut response_for = incoming_ctx();
        match msg.take_resp_for() {
            Ok(Some(counters)) => {
                if response_for.is_some() {
                    let e = SyncError::BadEncoding(
                        "a message cannot both be a response and require a response".into(),
                    );
                    handler.send_error(self, &e, response_for);
                    return;
                }
                let contexts: Vec<ResponseContext> = {
                    let mut state = self.state.lock();
                    counters.iter().filter_map(|c| state.expected.remove(c)).collect()
                };
                for ctx in contexts {
                    ctx.mark_responded();
                    match &response_for {
                        Some(existing) => existing.merge(&ctx),
                        None => response_for = Some(ctx),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                handler.send_error(self, &e.into(), response_for);
                return;
            }
        }

        let is_error = msg.is_error();
        let sync_type = msg.sync_type().unwrap_or_default().to_string();
        if let Err(e) = handler.receive(self, msg, response_for.clone()) {
            warn!(dest = %self.name, %sync_type, error = %e, "rejected incoming object");
            if let Some(ctx) = &response_for {
                ctx.resolve(Err(e.clone()));
            }
            if e.wire_type().is_some() && !is_error {
                handler.send_error(self, &e, response_for);
            }
        }
    }
}

impl NoResponseSink for Connection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn dest_hash(&self) -> DestHash {
        self.dest_hash
    }

    fn no_response(&self, counters: Vec<u32>) {
        if self.is_closed() {
            return;
        }
        self.state.lock().pending_no_resp.extend(counters);
        self.wake.notify_one();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("dest", &self.name)
            .field("state", &self.lifecycle())
            .finish()
    }
}
