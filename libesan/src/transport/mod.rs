//! CSI gRPC over a Unix socket.
//!
//! [`CsiServer`](server::CsiServer) serves the `csi.v1` Identity, Controller
//! and Node services generated from `proto/csi.proto` with tonic;
//! [`CsiClient`](client::CsiClient) dials the same socket.  The
//! [`convert`] module maps between the generated messages and the domain
//! types, and [`CsiError`](crate::CsiError) maps onto `tonic::Status`.

pub mod client;
pub mod convert;
pub mod server;
