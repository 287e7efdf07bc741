//! # Entanglement Testkit
//!
//! Test utilities for Entanglement.
//!
//! This crate provides:
//! - In-memory meshes of sync managers wired over a `MemoryNetwork`
//! - A scripted peer that records raw traffic and sends hand-built messages
//! - Sample application types covering stored objects, messages,
//!   owner-assigned keys and transitions
//! - Polling helpers for asynchronous convergence
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entanglement_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn widgets_reach_the_client() {
//!     let mut mesh = Mesh::new();
//!     let server = mesh.add_node("server");
//!     let client = mesh.add_node("client");
//!     mesh.link("client", "server");
//!     server.commit(&Widget::new(1, "gear")).unwrap();
//!     assert!(wait_until(DEFAULT_WAIT, || client.count::<Widget>() == 1).await);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod peer;
pub mod types;
pub mod wait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::peer::*;
    pub use crate::types::*;
    pub use crate::wait::*;
    pub use entanglement_engine::{
        ConnectionState, DestHash, Destination, Endpoint, Epoch, ManagerConfig, Operation, OwnerRef, Registry, SyncError,
        SyncManager, SyncObject, SyncOptions, Syncable,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use peer::*;
pub use types::*;
pub use wait::*;
