//! Remote storage seam for the PCS netdisk client.
//!
//! [`RemoteService`] is the contract every other crate is written against.
//! [`PcsClient`] speaks the PCS REST API; the `memory` feature adds an
//! in-process backend for tests.

mod client;
pub mod error;
pub mod service;
mod wire;

#[cfg(feature = "memory")]
pub mod memory;

pub use client::{ClientOptions, Endpoints, PcsClient};
pub use error::RemoteError;
pub use service::{RemoteFuture, RemoteService};
