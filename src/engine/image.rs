//! The image engine.
//!
//! Mounts a single-file image bundle through a loop device, opening a
//! LUKS2 mapper first when the image is encrypted, switches into the
//! mounted root, and execs the payload. This is the engine the
//! starter binary runs by default.

use crate::config::types::{CommonConfig, NamespaceFlags, Result, StarterError};
use crate::core::master::monitor_child;
use crate::core::types::{ContainerStatus, BARRIER_CONTINUE};
use crate::engine::direct::exec_payload;
use crate::engine::EngineOperations;
use crate::kernel::loopdev::{LoopInfo, LO_FLAGS_AUTOCLEAR};
use crate::kernel::namespace;
use crate::rpc::types::RemoteError;
use crate::rpc::RpcClient;
use crossbeam_channel::Receiver;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

pub const NAME: &str = "image";

fn default_filesystem() -> String {
    "squashfs".to_string()
}

fn default_max_loop_devices() -> u32 {
    256
}

fn default_chroot_method() -> String {
    namespace::CHROOT_METHOD.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image file to mount; finalized from the common configuration
    /// during `prepare_config`.
    #[serde(default)]
    pub image: PathBuf,
    /// Directory the image is mounted on and chrooted into.
    pub rootfs: PathBuf,
    /// Payload argv executed inside the container.
    pub command: Vec<String>,
    /// Extra KEY=VALUE pairs appended to the inherited environment.
    #[serde(default)]
    pub env: Vec<String>,
    /// Filesystem type inside the image (or inside the mapper for
    /// encrypted images).
    #[serde(default = "default_filesystem")]
    pub filesystem: String,
    /// Passphrase for a LUKS2-encrypted image.
    #[serde(default)]
    pub key: Option<Vec<u8>>,
    /// Byte offset of the filesystem partition inside the image file.
    #[serde(default)]
    pub offset: u64,
    /// Size limit of the partition; zero means to the end of the file.
    #[serde(default)]
    pub size_limit: u64,
    #[serde(default)]
    pub writable: bool,
    #[serde(default = "default_max_loop_devices")]
    pub max_loop_devices: u32,
    #[serde(default)]
    pub namespaces: NamespaceFlags,
    #[serde(default = "default_chroot_method")]
    pub chroot_method: String,
    /// Instance id and telemetry socket, finalized from the common
    /// configuration during `prepare_config`.
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub telemetry_socket: Option<PathBuf>,
}

pub struct ImageEngine {
    config: ImageConfig,
}

impl ImageEngine {
    pub fn from_config(value: serde_json::Value) -> Result<Self> {
        let config: ImageConfig = serde_json::from_value(value)
            .map_err(|e| StarterError::Engine(format!("invalid image engine config: {e}")))?;
        Ok(ImageEngine { config })
    }
}

impl EngineOperations for ImageEngine {
    fn config_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.config)
            .map_err(|e| StarterError::Engine(format!("image engine config: {e}")))
    }

    fn prepare_config(&mut self, common: &mut CommonConfig) -> Result<NamespaceFlags> {
        if self.config.command.is_empty() {
            return Err(StarterError::Config("empty command".to_string()));
        }
        if !common.image.is_file() {
            return Err(StarterError::Config(format!(
                "image {} does not exist",
                common.image.display()
            )));
        }
        self.config.image = common.image.clone();
        self.config.container_id = common.container_id.clone();
        self.config.telemetry_socket = common.telemetry_socket.clone();
        // The container root must live in its own mount namespace.
        self.config.namespaces.mount = true;
        Ok(self.config.namespaces)
    }

    fn create_container(&self, _pid: Pid, rpc: &mut RpcClient) -> Result<()> {
        mkdir_exist_ok(rpc, &self.config.rootfs)?;

        let info = LoopInfo {
            offset: self.config.offset,
            size_limit: self.config.size_limit,
            flags: LO_FLAGS_AUTOCLEAR,
            encrypt_type: 0,
        };
        let read_only = !self.config.writable;
        let index = rpc.loop_attach(
            &self.config.image,
            read_only,
            info,
            self.config.max_loop_devices,
            read_only,
        )?;
        let loopdev = PathBuf::from(format!("/dev/loop{index}"));
        debug!("image attached at {}", loopdev.display());

        let device = match &self.config.key {
            Some(key) => {
                let mapper = rpc.crypt_open(key, &loopdev)?;
                PathBuf::from(format!("/dev/mapper/{mapper}"))
            }
            None => loopdev,
        };

        let mut flags: u64 = (libc::MS_NOSUID | libc::MS_NODEV) as u64;
        if read_only {
            flags |= libc::MS_RDONLY as u64;
        }
        rpc.mount(
            Some(&device),
            &self.config.rootfs,
            Some(&self.config.filesystem),
            flags,
            None,
        )?;
        debug!(
            "container root mounted at {}",
            self.config.rootfs.display()
        );
        Ok(())
    }

    fn start_process(&self, master: &mut UnixStream) -> Result<std::convert::Infallible> {
        namespace::enter_root(&self.config.rootfs, &self.config.chroot_method)?;
        master.write_all(&[BARRIER_CONTINUE])?;
        master.flush()?;
        exec_payload(&self.config.command, &self.config.env)
    }

    fn post_start_process(&self, pid: Pid) -> Result<()> {
        debug!("container process started as pid {pid}");
        if let Some(socket) = &self.config.telemetry_socket {
            // Telemetry is best effort; a missing collector must not
            // take the container down.
            match UnixStream::connect(socket) {
                Ok(mut stream) => {
                    let record = serde_json::json!({
                        "container_id": self.config.container_id,
                        "pid": pid.as_raw(),
                    });
                    if let Err(err) = stream.write_all(record.to_string().as_bytes()) {
                        debug!("telemetry write failed: {err}");
                    }
                }
                Err(err) => debug!("telemetry socket unavailable: {err}"),
            }
        }
        Ok(())
    }

    fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<ContainerStatus> {
        monitor_child(pid, signals)
    }

    fn cleanup_container(
        &self,
        fatal: Option<&StarterError>,
        status: ContainerStatus,
    ) -> Result<()> {
        if let Some(err) = fatal {
            warn!("cleaning up after fatal error: {err}");
        }
        debug!("cleanup with container status {status:?}");
        // Mounts, mappers, and loop devices were created through the
        // RPC server and are released with its resource ledger.
        Ok(())
    }
}

/// mkdir that tolerates an existing directory.
fn mkdir_exist_ok(rpc: &mut RpcClient, path: &std::path::Path) -> Result<()> {
    match rpc.mkdir(path, 0o755) {
        Ok(()) => Ok(()),
        Err(StarterError::Remote(RemoteError::Path { errno, .. }))
            if errno == Errno::EEXIST as i32 =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::user::User;

    fn test_common(image: PathBuf) -> CommonConfig {
        CommonConfig {
            engine_name: NAME.to_string(),
            container_id: "t".to_string(),
            image,
            original_user: User {
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

    #[test]
    fn config_defaults_fill_in() {
        let engine = ImageEngine::from_config(serde_json::json!({
            "rootfs": "/var/run/box",
            "command": ["/bin/sh"],
        }))
        .unwrap();
        assert_eq!(engine.config.filesystem, "squashfs");
        assert_eq!(engine.config.max_loop_devices, 256);
        assert_eq!(engine.config.chroot_method, namespace::CHROOT_METHOD);
        assert!(engine.config.key.is_none());
        assert!(!engine.config.writable);
    }

    #[test]
    fn prepare_requires_an_existing_image() {
        let mut engine = ImageEngine::from_config(serde_json::json!({
            "rootfs": "/var/run/box",
            "command": ["/bin/sh"],
        }))
        .unwrap();
        let mut common = test_common(PathBuf::from("/nonexistent/image.sif"));
        assert!(engine.prepare_config(&mut common).is_err());
    }

    #[test]
    fn prepare_forces_a_mount_namespace_and_adopts_the_image() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let mut engine = ImageEngine::from_config(serde_json::json!({
            "rootfs": "/var/run/box",
            "command": ["/bin/sh"],
        }))
        .unwrap();
        let mut common = test_common(image.path().to_path_buf());
        let flags = engine.prepare_config(&mut common).unwrap();
        assert!(flags.mount);
        assert_eq!(engine.config.image, image.path());
    }
}
