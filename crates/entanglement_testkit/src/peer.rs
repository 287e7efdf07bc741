//! A hand-driven peer speaking raw frames to one sync manager.
//!
//! [`ScriptedPeer`] records every message the manager sends it and lets a
//! test write arbitrary messages back, including ones a well-behaved
//! manager would never produce.

use crate::fixtures::node_hash;
use bytes::BytesMut;
use entanglement_engine::{
    Connected, Destination, Epoch, SyncManager, I_HAVE, SYNC_OWNER, YOU_HAVE,
};
use entanglement_protocol::{DestHash, Frame, FrameDecoder, SyncMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;
use uuid::Uuid;

const STREAM_BUFFER: usize = 64 * 1024;

/// A peer whose side of the connection is scripted by the test.
pub struct ScriptedPeer {
    hash: DestHash,
    writer: WriteHalf<DuplexStream>,
    received: Arc<Mutex<Vec<SyncMessage>>>,
    reader: JoinHandle<()>,
}

impl ScriptedPeer {
    /// Registers `name` as a passive destination of `manager` and connects to it.
    pub async fn connect(manager: &SyncManager, name: &str) -> Self {
        let hash = node_hash(name);
        manager
            .add_destination(Destination::new(hash, name))
            .expect("Failed to add scripted destination");

        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER);
        let (mut read, writer) = tokio::io::split(ours);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let reader = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = BytesMut::with_capacity(STREAM_BUFFER);
            loop {
                while let Ok(Some(frame)) = decoder.decode_one(&mut buf) {
                    if let Ok(msg) = SyncMessage::from_slice(&frame.payload) {
                        sink.lock().push(msg);
                    }
                }
                match read.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        manager
            .accept(Connected {
                stream: Box::new(theirs),
                peer: hash,
            })
            .await;
        Self {
            hash,
            writer,
            received,
            reader,
        }
    }

    /// This peer's identity.
    pub fn dest_hash(&self) -> DestHash {
        self.hash
    }

    /// Writes one message without asking for a response.
    pub async fn send(&mut self, msg: &SyncMessage) {
        let payload = msg.to_vec().expect("Failed to encode message");
        let bytes = Frame::new(payload, 0).encode().expect("Failed to frame message");
        self.writer.write_all(&bytes).await.expect("Failed to write frame");
    }

    /// Announces `owner` as provided by this peer.
    pub async fn announce_owner(&mut self, owner: Uuid, epoch: Epoch) {
        let mut msg = SyncMessage::for_type(SYNC_OWNER);
        msg.set_owner(owner);
        msg.insert("id", Value::String(owner.to_string()));
        msg.insert("epoch", Value::String(epoch.to_wire()));
        self.send(&msg).await;
    }

    /// Asks for everything about `owner` after `serial`.
    pub async fn i_have(&mut self, owner: Uuid, serial: u64, epoch: Epoch) {
        let mut msg = serial_message(I_HAVE, owner, serial, epoch);
        msg.set_operation("forward");
        self.send(&msg).await;
    }

    /// Reports a high-water mark for `owner`.
    pub async fn you_have(&mut self, owner: Uuid, serial: u64, epoch: Epoch) {
        self.send(&serial_message(YOU_HAVE, owner, serial, epoch)).await;
    }

    /// Every message received so far, in arrival order.
    pub fn received(&self) -> Vec<SyncMessage> {
        self.received.lock().clone()
    }

    /// Received messages of one type.
    pub fn received_of(&self, sync_type: &str) -> Vec<SyncMessage> {
        self.received
            .lock()
            .iter()
            .filter(|msg| msg.sync_type() == Some(sync_type))
            .cloned()
            .collect()
    }

    /// The epoch the manager announced for `owner`, once its `SyncOwner` arrived.
    pub fn announced_epoch(&self, owner: Uuid) -> Option<Epoch> {
        self.received_of(SYNC_OWNER)
            .iter()
            .filter(|msg| msg.get("id").and_then(Value::as_str) == Some(owner.to_string().as_str()))
            .filter_map(|msg| msg.get("epoch").and_then(Value::as_str).map(str::to_owned))
            .last()
            .and_then(|text| Epoch::from_wire(&text).ok())
    }
}

impl Drop for ScriptedPeer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn serial_message(sync_type: &str, owner: Uuid, serial: u64, epoch: Epoch) -> SyncMessage {
    let mut msg = SyncMessage::for_type(sync_type);
    msg.set_owner(owner);
    msg.insert("serial", Value::from(serial));
    msg.insert("epoch", Value::String(epoch.to_wire()));
    msg
}
