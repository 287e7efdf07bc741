//! # Entanglement Engine
//!
//! Mesh synchronization runtime for Entanglement.
//!
//! This crate provides:
//! - `SyncManager`, one endpoint of the mesh, with a typed local API
//! - Class registries and receive hooks for application types
//! - Per-connection dirty queues with coalescing, priorities and drain
//! - Response tracking across multi-hop forwards
//! - Owners, serials and incremental catch-up after reconnects
//! - Transitions: provisional states confirmed or broken by the owner
//! - Outgoing connection management with backoff and bandwidth limits
//!
//! ## Architecture
//!
//! Every object has one authoritative **owner**. Changes made elsewhere
//! travel toward the owner as `forward`, `create`, `delete` or
//! `transition` operations; the owner commits them and floods the result
//! to the whole mesh as `sync`. Endpoints relay floods to their other
//! peers, so the mesh needs no direct link between every pair.
//!
//! A reconnecting peer catches up with `IHave`/`YouHave`: it names the
//! highest serial it holds per owner and receives only what is newer.
//!
//! ## Key Invariants
//!
//! - Only the owner assigns serials; they increase with every commit
//! - An object is queued at most once per connection; newer state replaces older
//! - Queued items leave in priority order, FIFO within a priority
//! - Every request that needs a response gets exactly one outcome
//! - Catch-up messages are never relayed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bandwidth;
mod catchup;
mod config;
mod connection;
mod destination;
mod dirty;
mod error;
mod manager;
mod object;
mod operations;
mod owner;
mod receive;
mod registry;
mod response;
mod store;
mod transition;
mod transport;

pub use catchup::{ERROR_REGISTRY, I_HAVE, META_REGISTRY, MY_OWNERS, SYNC_OWNER, WRONG_EPOCH, YOU_HAVE};
pub use config::{BackoffConfig, BandwidthConfig, ManagerConfig};
pub use connection::{ConnectionState, ConnectionStats};
pub use destination::{Destination, Endpoint};
pub use error::{SyncError, SyncResult, ERROR_ATTRIBUTES};
pub use manager::{SyncManager, SyncManagerBuilder, SyncOptions, UnknownDestinationHook};
pub use object::{AttributeSet, OwnerRef, PrimaryKey, SyncObject, SERIAL_ATTRIBUTE, TRANSITION_ATTRIBUTE};
pub use operations::Operation;
pub use owner::{Epoch, OwnerRecord};
pub use registry::{
    ClassDescriptor, ClassKind, PrimaryKeys, ReceiveInfo, Registry, RegistryHooks, Syncable, DEFAULT_PRIORITY,
    ERROR_PRIORITY, META_PRIORITY, OWNER_PRIORITY,
};
pub use response::{ResponseContext, ResponseFuture, ResponseOutcome};
pub use transport::{
    AsyncStream, BoxFuture, BoxStream, Connected, Connector, Listener, MemoryConnector, MemoryListener, MemoryNetwork,
};

pub use entanglement_protocol::DestHash;
