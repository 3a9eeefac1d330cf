//! The direct engine.
//!
//! Runs a payload in the requested namespaces without mounting an
//! image. Used for probing the starter machinery and for payloads
//! that bring their own root.

use crate::config::types::{CommonConfig, NamespaceFlags, Result, StarterError};
use crate::core::master::monitor_child;
use crate::core::types::{ContainerStatus, BARRIER_CONTINUE};
use crate::engine::{EngineOperations, PreStartProcess};
use crate::rpc::RpcClient;
use crossbeam_channel::Receiver;
use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;

pub const NAME: &str = "direct";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectConfig {
    /// Payload argv; the first element is resolved through PATH.
    pub command: Vec<String>,
    /// Extra KEY=VALUE pairs appended to the inherited environment.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub namespaces: NamespaceFlags,
}

pub struct DirectEngine {
    config: DirectConfig,
}

impl DirectEngine {
    pub fn from_config(value: serde_json::Value) -> Result<Self> {
        let config: DirectConfig = serde_json::from_value(value)
            .map_err(|e| StarterError::Engine(format!("invalid direct engine config: {e}")))?;
        Ok(DirectEngine { config })
    }
}

impl EngineOperations for DirectEngine {
    fn config_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.config)
            .map_err(|e| StarterError::Engine(format!("direct engine config: {e}")))
    }

    fn prepare_config(&mut self, _common: &mut CommonConfig) -> Result<NamespaceFlags> {
        if self.config.command.is_empty() {
            return Err(StarterError::Config("empty command".to_string()));
        }
        Ok(self.config.namespaces)
    }

    fn create_container(&self, _pid: Pid, rpc: &mut RpcClient) -> Result<()> {
        // Nothing to build; one probing call verifies the privileged
        // channel end to end before the payload runs.
        let root = rpc.stat(Path::new("/"))?;
        if !root.info.is_dir {
            return Err(StarterError::Engine(
                "server root is not a directory".to_string(),
            ));
        }
        Ok(())
    }

    fn pre_start(&self) -> Option<&dyn PreStartProcess> {
        Some(self)
    }

    fn start_process(&self, master: &mut UnixStream) -> Result<std::convert::Infallible> {
        master.write_all(&[BARRIER_CONTINUE])?;
        master.flush()?;
        exec_payload(&self.config.command, &self.config.env)
    }

    fn post_start_process(&self, pid: Pid) -> Result<()> {
        debug!("container process started as pid {pid}");
        Ok(())
    }

    fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<ContainerStatus> {
        monitor_child(pid, signals)
    }

    fn cleanup_container(
        &self,
        _fatal: Option<&StarterError>,
        _status: ContainerStatus,
    ) -> Result<()> {
        Ok(())
    }
}

impl PreStartProcess for DirectEngine {
    fn pre_start_process(&self, pid: Pid, _master: &mut UnixStream) -> Result<()> {
        debug!("pre start for pid {pid}");
        Ok(())
    }
}

/// Replace the current process with the payload. Extra environment
/// entries are applied on top of the inherited environment.
pub fn exec_payload(command: &[String], extra_env: &[String]) -> Result<std::convert::Infallible> {
    use std::ffi::CString;

    if command.is_empty() {
        return Err(StarterError::Config("empty argv for exec".to_string()));
    }
    for entry in extra_env {
        match entry.split_once('=') {
            Some((key, value)) => std::env::set_var(key, value),
            None => {
                return Err(StarterError::Config(format!(
                    "malformed environment entry {entry}"
                )))
            }
        }
    }

    let mut argv = Vec::with_capacity(command.len());
    for arg in command {
        argv.push(
            CString::new(arg.as_str())
                .map_err(|_| StarterError::Config("command contains NUL byte".to_string()))?,
        );
    }
    let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(|a| a.as_c_str()).collect();

    match nix::unistd::execvp(argv_refs[0], &argv_refs) {
        Err(err) => Err(StarterError::Process(format!(
            "exec of {} failed: {err}",
            command[0]
        ))),
        Ok(infallible) => match infallible {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected_before_fork() {
        let mut engine = DirectEngine::from_config(serde_json::json!({"command": []})).unwrap();
        let mut common = test_common();
        assert!(engine.prepare_config(&mut common).is_err());
    }

    #[test]
    fn config_json_round_trips() {
        let engine = DirectEngine::from_config(serde_json::json!({
            "command": ["/bin/true"],
            "env": ["FOO=bar"],
        }))
        .unwrap();
        let value = engine.config_json().unwrap();
        let again = DirectEngine::from_config(value).unwrap();
        assert_eq!(again.config.command, vec!["/bin/true".to_string()]);
        assert_eq!(again.config.env, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn direct_engine_advertises_the_pre_start_hook() {
        let engine = DirectEngine::from_config(serde_json::json!({"command": ["/bin/true"]}))
            .unwrap();
        assert!(engine.pre_start().is_some());
    }

    fn test_common() -> CommonConfig {
        CommonConfig {
            engine_name: NAME.to_string(),
            container_id: "t".to_string(),
            image: "/dev/null".into(),
            original_user: crate::utils::user::User {
                name: "t".into(),
                uid: 0,
                gid: 0,
                gecos: String::new(),
                dir: "/".into(),
                shell: "/bin/sh".into(),
            },
            namespaces: NamespaceFlags::none(),
            telemetry_socket: None,
        }
    }
}
