//! Typed RPC between the stages and the privileged master.
//!
//! One connected socket pair is inherited across the fork; the stage
//! side issues one request at a time and the master side executes it
//! with its retained capabilities. Registered error types round-trip
//! so a remote errno is indistinguishable from a local one.

pub mod client;
pub mod server;
pub mod types;
pub mod wire;

pub use client::RpcClient;
pub use server::{ResourceLedger, RpcServer};
