//! The three-process starter model.
//!
//! The master keeps privileges and supervises; stage-1 creates
//! namespaces and drives container creation over RPC; stage-2 runs
//! inside the container and execs the payload.

pub mod master;
pub mod stage;
pub mod types;
