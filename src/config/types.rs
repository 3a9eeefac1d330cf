//! Core types and the crate-wide error enum for the starter.

use crate::rpc::types::RemoteError;
use crate::utils::user::User;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used across the starter.
pub type Result<T> = std::result::Result<T, StarterError>;

/// Errors raised by the starter core.
#[derive(Error, Debug)]
pub enum StarterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Loop device error: {0}")]
    Loop(String),

    /// No free loop device below the configured maximum.
    #[error("no loop devices available")]
    LoopDevicesExhausted,

    #[error("Crypt device error: {0}")]
    Crypt(String),

    /// cryptsetup older than the 2.x series.
    #[error("installed version of cryptsetup is not supported, >=2.0.0 required")]
    UnsupportedCryptsetupVersion,

    /// Distinguished sentinel for an open attempt with the wrong key.
    #[error("no key available with this passphrase")]
    InvalidPassphrase,

    /// Mapper-name allocation retries exceeded.
    #[error("unable to open crypt device")]
    MapperNamesExhausted,

    #[error("RPC error: {0}")]
    Rpc(String),

    /// A typed error carried back over the RPC connection.
    #[error("{0}")]
    Remote(#[from] RemoteError),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Signal handling error: {0}")]
    Signal(String),
}

impl StarterError {
    /// Raw errno carried by this error, when one is attached.
    pub fn errno(&self) -> Option<i32> {
        match self {
            StarterError::Io(err) => err.raw_os_error(),
            StarterError::Remote(err) => err.errno(),
            _ => None,
        }
    }
}

/// Namespace selection negotiated by `prepare_config` and applied by
/// stage-1 before container creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceFlags {
    #[serde(default)]
    pub pid: bool,
    #[serde(default)]
    pub mount: bool,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub user: bool,
    #[serde(default)]
    pub ipc: bool,
    #[serde(default)]
    pub uts: bool,
}

impl NamespaceFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Configuration shared by every engine and reconstructed identically
/// in all three starter processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Engine kind, one of the names known to the engine registry.
    pub engine_name: String,
    /// Unique identifier for this container instance.
    pub container_id: String,
    /// Single-file image bundle backing the container.
    pub image: PathBuf,
    /// Identity of the invoking user, captured before any user
    /// namespace is created.
    pub original_user: User,
    /// Namespaces chosen by the engine during `prepare_config`.
    #[serde(default)]
    pub namespaces: NamespaceFlags,
    /// Optional telemetry socket the master attaches after start.
    #[serde(default)]
    pub telemetry_socket: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_flags_default_is_empty() {
        assert!(NamespaceFlags::none().is_empty());
        let flags = NamespaceFlags {
            mount: true,
            ..NamespaceFlags::none()
        };
        assert!(!flags.is_empty());
    }

    #[test]
    fn sentinel_errors_have_stable_messages() {
        assert_eq!(
            StarterError::InvalidPassphrase.to_string(),
            "no key available with this passphrase"
        );
        assert_eq!(
            StarterError::UnsupportedCryptsetupVersion.to_string(),
            "installed version of cryptsetup is not supported, >=2.0.0 required"
        );
    }
}
