//! # libesan: CSI volume lifecycle for e-SAN block arrays
//!
//! `libesan` implements the Identity, Controller and Node services of a
//! [Container Storage Interface][csi] plugin for e-SAN arrays.  The controller
//! provisions and maps volumes through the array's management API; the node
//! service logs in to the fabric target (iSCSI, FC or NVMe-oF), formats and
//! mounts the device and bind-mounts it into Pods.  Requests reach the
//! services as CSI gRPC calls on a Unix socket.  Everything runs on Tokio
//! and logs through `tracing`.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: volumes, capabilities, requests, topology. |
//! | [`error`] | [`CsiError`] enum and its RPC status codes. |
//! | [`config`] | [`DriverConfig`](config::DriverConfig): YAML, env overrides, validation. |
//! | [`lock`] | Per-resource operation locks with bounded waits. |
//! | [`registry`] | Volume, publish and snapshot records, optionally persisted. |
//! | [`capability`] | Access-mode policy and advertised capabilities. |
//! | [`context`] | [`DriverContext`](context::DriverContext) shared by the services. |
//! | [`backend`] | [`BackendClient`](backend::BackendClient): e-SAN HTTP client and an in-memory fake. |
//! | [`identity`] | [`CsiIdentity`]: plugin discovery and health. |
//! | [`controller`] | [`CsiController`]: create, delete, publish, expand, snapshot. |
//! | [`node`] | [`CsiNode`]: stage, publish, unpublish, unstage, stats. |
//! | [`csi`] | Messages and service stubs generated from `csi.proto`. |
//! | [`transport`] | gRPC server and client on a Unix socket. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

/// `csi.v1` messages, service traits and clients generated by tonic.
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod backend;
pub mod capability;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod identity;
pub mod lock;
pub mod node;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use controller::{ControllerService, CsiController};
pub use error::{Code, CsiError};
pub use identity::{CsiIdentity, IdentityService};
pub use node::{CsiNode, NodeService};
pub use types::*;
