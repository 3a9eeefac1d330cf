//! Shared configuration and error types.

pub mod types;

pub use types::{CommonConfig, NamespaceFlags, Result, StarterError};
