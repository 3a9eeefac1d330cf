//! Pluggable container engines.
//!
//! An engine decides what "setting up a container" means for a given
//! launch. The engine value is constructed once in the master,
//! serialized into an inherited descriptor, and reconstructed
//! identically in the stages; all cross-process state travels through
//! that envelope, inherited descriptors, or the kernel.

pub mod direct;
pub mod image;

use crate::config::types::{CommonConfig, NamespaceFlags, Result, StarterError};
use crate::core::types::ContainerStatus;
use crate::rpc::RpcClient;
use crossbeam_channel::Receiver;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::os::unix::net::UnixStream;

/// Version stamped into every serialized engine envelope. Stages
/// reject an envelope from a different build rather than guessing at
/// its layout.
pub const ENGINE_CONFIG_VERSION: u32 = 1;

/// Optional capability for engines that must act between container
/// setup and payload exec.
pub trait PreStartProcess {
    fn pre_start_process(&self, pid: Pid, master: &mut UnixStream) -> Result<()>;
}

/// Lifecycle hooks invoked by the stages at fixed points.
///
/// All hooks must be callable from any thread except `start_process`,
/// which runs on the thread that performs the `execve`.
pub trait EngineOperations: Send + Sync {
    /// Engine-specific configuration for re-serialization.
    fn config_json(&self) -> Result<serde_json::Value>;

    /// Validate and finalize configuration in the master, before the
    /// fork. Returns the namespaces stage-1 must create.
    fn prepare_config(&mut self, common: &mut CommonConfig) -> Result<NamespaceFlags>;

    /// Build the container from stage-1, issuing privileged work over
    /// the RPC client.
    fn create_container(&self, pid: Pid, rpc: &mut RpcClient) -> Result<()>;

    /// Capability lookup for the optional pre-start hook.
    fn pre_start(&self) -> Option<&dyn PreStartProcess> {
        None
    }

    /// Replace stage-2 with the container payload. Implementations
    /// write the final readiness byte to the master socket immediately
    /// before `execve`, or `'f'` on failure, and only ever return an
    /// error.
    fn start_process(&self, master: &mut UnixStream) -> Result<std::convert::Infallible>;

    /// Record the container PID, attach telemetry, register with a
    /// resource manager. Runs in the master once the start barrier
    /// reports the container up.
    fn post_start_process(&self, pid: Pid) -> Result<()>;

    /// Block until the container exits, forwarding queued signals.
    fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<ContainerStatus>;

    /// Release engine-specific resources. Runs in the master strictly
    /// after the fatal channel delivered.
    fn cleanup_container(
        &self,
        fatal: Option<&StarterError>,
        status: ContainerStatus,
    ) -> Result<()>;
}

/// An engine: shared configuration plus polymorphic behavior.
pub struct Engine {
    pub common: CommonConfig,
    pub operations: Box<dyn EngineOperations>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("common", &self.common)
            .field("operations", &"<dyn EngineOperations>")
            .finish()
    }
}

/// Serialized form of an engine.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    name: String,
    common: CommonConfig,
    engine: serde_json::Value,
}

impl Engine {
    /// Construct an engine by registry name. The set of engines is
    /// closed at build time.
    pub fn from_name(
        name: &str,
        common: CommonConfig,
        config: serde_json::Value,
    ) -> Result<Engine> {
        let operations: Box<dyn EngineOperations> = match name {
            image::NAME => Box::new(image::ImageEngine::from_config(config)?),
            direct::NAME => Box::new(direct::DirectEngine::from_config(config)?),
            other => {
                return Err(StarterError::Engine(format!("unknown engine {other}")));
            }
        };
        Ok(Engine { common, operations })
    }

    /// Serialize this engine into the envelope written to the config
    /// descriptor.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let envelope = Envelope {
            version: ENGINE_CONFIG_VERSION,
            name: self.common.engine_name.clone(),
            common: self.common.clone(),
            engine: self.operations.config_json()?,
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| StarterError::Engine(format!("engine serialization failed: {e}")))
    }

    /// Reconstruct an engine from a serialized envelope. Rejects
    /// envelopes from a different config version.
    pub fn deserialize(data: &[u8]) -> Result<Engine> {
        let envelope: Envelope = serde_json::from_slice(data)
            .map_err(|e| StarterError::Engine(format!("engine deserialization failed: {e}")))?;
        if envelope.version != ENGINE_CONFIG_VERSION {
            return Err(StarterError::Engine(format!(
                "engine config version {} does not match {}",
                envelope.version, ENGINE_CONFIG_VERSION
            )));
        }
        Engine::from_name(&envelope.name, envelope.common, envelope.engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::user::User;
    use std::path::PathBuf;

    fn common(engine_name: &str) -> CommonConfig {
        CommonConfig {
            engine_name: engine_name.to_string(),
            container_id: "test-container".to_string(),
            image: PathBuf::from("/tmp/image.sif"),
            original_user: User {
                name: "tester".into(),
                uid: 1000,
                gid: 1000,
                gecos: String::new(),
                dir: "/home/tester".into(),
                shell: "/bin/sh".into(),
            },
            namespaces: NamespaceFlags::none(),
            telemetry_socket: None,
        }
    }

    #[test]
    fn engine_round_trips_through_the_envelope() {
        let config = serde_json::json!({
            "command": ["/bin/true"],
        });
        let engine = Engine::from_name(direct::NAME, common(direct::NAME), config).unwrap();
        let blob = engine.serialize().unwrap();
        let rebuilt = Engine::deserialize(&blob).unwrap();
        assert_eq!(rebuilt.common.container_id, engine.common.container_id);
        assert_eq!(rebuilt.common.original_user, engine.common.original_user);
        // The reconstructed engine serializes to the identical blob.
        assert_eq!(rebuilt.serialize().unwrap(), blob);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let engine = Engine::from_name(
            direct::NAME,
            common(direct::NAME),
            serde_json::json!({"command": ["/bin/true"]}),
        )
        .unwrap();
        let blob = engine.serialize().unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        value["version"] = serde_json::json!(99);
        let tampered = serde_json::to_vec(&value).unwrap();
        let err = Engine::deserialize(&tampered).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn unknown_engines_are_rejected() {
        let err =
            Engine::from_name("warp", common("warp"), serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, StarterError::Engine(_)));
    }
}
