//! Privileged RPC server.
//!
//! Runs in the master (or a root-capable helper in the setuid flow)
//! and executes filesystem, mount, loop, and crypt operations on
//! behalf of the unprivileged stages. Capabilities are never dropped
//! here; callers are not authenticated because only the master's own
//! children hold the peer socket.

use crate::config::types::{Result, StarterError};
use crate::crypt::CryptDevice;
use crate::kernel::{loopdev, mount, namespace};
use crate::rpc::types::*;
use crate::rpc::wire;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::stat::{lstat, umask, Mode};
use nix::unistd::{close, Gid, Uid};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Resources created through the server, torn down at cleanup. Mounts
/// unwind in reverse order before mappers close and loops detach.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    pub mounts: Vec<PathBuf>,
    pub mappers: Vec<String>,
    pub loops: Vec<(u32, PathBuf)>,
}

impl ResourceLedger {
    /// Release everything recorded in this ledger. Failures are logged
    /// and do not stop the teardown; they must never mask the root
    /// cause of a fatal error.
    pub fn teardown(&mut self, crypt: &CryptDevice) {
        while let Some(target) = self.mounts.pop() {
            if let Err(err) = mount::unmount(&target, libc::MNT_DETACH) {
                warn!("cleanup unmount of {} failed: {err}", target.display());
            }
        }
        while let Some(name) = self.mappers.pop() {
            if let Err(err) = crypt.close(&name) {
                warn!("cleanup close of mapper {name} failed: {err}");
            }
        }
        while let Some((index, image)) = self.loops.pop() {
            // Auto-clear detaches with the last close; an explicit
            // detach here covers devices still pinned by a mount that
            // failed to unwind.
            if let Err(err) = loopdev::detach(index) {
                debug!(
                    "cleanup detach of loop{index} ({}) failed: {err}",
                    image.display()
                );
            }
        }
    }
}

/// Server half of the inherited RPC socket pair.
pub struct RpcServer {
    fd: RawFd,
    resources: Arc<Mutex<ResourceLedger>>,
    crypt: CryptDevice,
}

impl RpcServer {
    pub fn new(fd: RawFd, resources: Arc<Mutex<ResourceLedger>>) -> Self {
        RpcServer {
            fd,
            resources,
            crypt: CryptDevice::default(),
        }
    }

    /// Serve requests until the peer closes its end of the socket.
    pub fn serve(&mut self) -> Result<()> {
        loop {
            let Some((request, fds)) = wire::recv_message::<Request>(self.fd)? else {
                debug!("rpc peer closed the connection");
                return Ok(());
            };
            // No request carries descriptors today; drop any strays.
            for fd in fds {
                let _ = close(fd);
            }

            let (reply, fds) = self.dispatch(request);
            let sent = wire::send_message(self.fd, &reply, &fds);
            for fd in fds {
                let _ = close(fd);
            }
            sent?;
        }
    }

    fn dispatch(&mut self, request: Request) -> (Reply, Vec<RawFd>) {
        debug!("rpc request: {request:?}");
        let reply = match request {
            Request::Mkdir(args) => self.mkdir(args),
            Request::Mount(args) => self.mount(args),
            Request::Unmount(args) => self.unmount(args),
            Request::Chroot(args) => self.chroot(args),
            Request::Chdir(args) => self.chdir(args),
            Request::Symlink(args) => self.symlink(args),
            Request::Chown(args) => self.chown(args),
            Request::Readdir(args) => self.readdir(args),
            Request::Readlink(args) => self.readlink(args),
            Request::Stat(args) => self.stat(args),
            Request::Access(args) => self.access(args),
            Request::WriteFile(args) => self.write_file(args),
            Request::SetHostname(args) => self.set_hostname(args),
            Request::Umask(args) => Reply::Mask(umask(Mode::from_bits_truncate(args.mask)).bits()),
            Request::LoopAttach(args) => self.loop_attach(args),
            Request::CryptOpen(args) => self.crypt_open(args),
            Request::CryptClose(args) => self.crypt_close(args),
            Request::SendFuseFd(_) => return self.send_fuse_fd(),
            Request::NvCcli(args) => self.nvccli(args),
        };
        (reply, Vec::new())
    }

    fn mkdir(&self, args: MkdirArgs) -> Reply {
        match nix::unistd::mkdir(&args.path, Mode::from_bits_truncate(args.mode)) {
            Ok(()) => Reply::Ok,
            Err(errno) => Reply::Error(RemoteError::path("mkdir", &args.path, errno)),
        }
    }

    fn mount(&self, args: MountArgs) -> Reply {
        let result = mount::mount_filesystem(
            args.source.as_deref(),
            &args.target,
            args.filesystem.as_deref(),
            args.flags,
            args.data.as_deref(),
        );
        match result {
            Ok(()) => {
                self.resources.lock().unwrap().mounts.push(args.target);
                Reply::Ok
            }
            Err(errno) => Reply::Error(RemoteError::path("mount", &args.target, errno)),
        }
    }

    fn unmount(&self, args: UnmountArgs) -> Reply {
        match mount::unmount(&args.target, args.flags) {
            Ok(()) => {
                let mut ledger = self.resources.lock().unwrap();
                ledger.mounts.retain(|target| *target != args.target);
                Reply::Ok
            }
            Err(errno) => Reply::Error(RemoteError::path("unmount", &args.target, errno)),
        }
    }

    fn chroot(&self, args: ChrootArgs) -> Reply {
        match namespace::enter_root(&args.root, &args.method) {
            Ok(()) => Reply::Ok,
            Err(err) => Reply::Error(RemoteError::message(err.to_string())),
        }
    }

    fn chdir(&self, args: ChdirArgs) -> Reply {
        match nix::unistd::chdir(&args.dir) {
            Ok(()) => Reply::Ok,
            Err(errno) => Reply::Error(RemoteError::path("chdir", &args.dir, errno)),
        }
    }

    fn symlink(&self, args: SymlinkArgs) -> Reply {
        match nix::unistd::symlinkat(&args.target, None, &args.link) {
            Ok(()) => Reply::Ok,
            Err(errno) => Reply::Error(RemoteError::link(
                "symlink",
                &args.target,
                &args.link,
                errno,
            )),
        }
    }

    fn chown(&self, args: ChownArgs) -> Reply {
        let uid = Some(Uid::from_raw(args.uid));
        let gid = Some(Gid::from_raw(args.gid));
        let result = if args.follow_symlink {
            nix::unistd::chown(&args.path, uid, gid)
        } else {
            nix::unistd::fchownat(
                None,
                &args.path,
                uid,
                gid,
                nix::unistd::FchownatFlags::NoFollowSymlink,
            )
        };
        match result {
            Ok(()) => Reply::Ok,
            Err(errno) => {
                let op = if args.follow_symlink { "chown" } else { "lchown" };
                Reply::Error(RemoteError::path(op, &args.path, errno))
            }
        }
    }

    fn readdir(&self, args: ReaddirArgs) -> Reply {
        let entries = match std::fs::read_dir(&args.dir) {
            Ok(iter) => iter,
            Err(err) => {
                return Reply::Error(RemoteError::path(
                    "readdir",
                    &args.dir,
                    Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO)),
                ))
            }
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    return Reply::Error(RemoteError::path(
                        "readdir",
                        &args.dir,
                        Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO)),
                    ))
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            match lstat(&entry.path()) {
                Ok(st) => {
                    let stat = StatSnapshot::from(&st);
                    snapshots.push(DirEntrySnapshot {
                        file_type: stat.mode & libc::S_IFMT,
                        info: FileInfoSnapshot::from_stat(&name, &stat),
                        name,
                    });
                }
                Err(errno) => {
                    return Reply::Error(RemoteError::path("lstat", &entry.path(), errno))
                }
            }
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Reply::Entries(snapshots)
    }

    fn readlink(&self, args: ReadlinkArgs) -> Reply {
        match nix::fcntl::readlink(&args.path) {
            Ok(target) => Reply::Path(PathBuf::from(target)),
            Err(errno) => Reply::Error(RemoteError::path("readlink", &args.path, errno)),
        }
    }

    fn stat(&self, args: StatArgs) -> Reply {
        match lstat(&args.path) {
            Ok(st) => {
                let stat = StatSnapshot::from(&st);
                let name = args
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| args.path.display().to_string());
                Reply::Stat(StatReply {
                    info: FileInfoSnapshot::from_stat(&name, &stat),
                    stat,
                })
            }
            Err(errno) => Reply::Error(RemoteError::path("stat", &args.path, errno)),
        }
    }

    fn access(&self, args: AccessArgs) -> Reply {
        let mode = nix::unistd::AccessFlags::from_bits_truncate(args.mode as libc::c_int);
        match nix::unistd::access(&args.path, mode) {
            Ok(()) => Reply::Ok,
            Err(errno) => Reply::Error(RemoteError::path("access", &args.path, errno)),
        }
    }

    fn write_file(&self, args: WriteFileArgs) -> Reply {
        let result = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(args.mode)
            .open(&args.path)
            .and_then(|mut file| file.write_all(&args.data));
        match result {
            Ok(()) => Reply::Ok,
            Err(err) => Reply::Error(RemoteError::path(
                "writefile",
                &args.path,
                Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO)),
            )),
        }
    }

    fn set_hostname(&self, args: HostnameArgs) -> Reply {
        match nix::unistd::sethostname(&args.hostname) {
            Ok(()) => Reply::Ok,
            Err(errno) => Reply::Error(RemoteError::syscall("sethostname", errno)),
        }
    }

    fn loop_attach(&self, args: LoopAttachArgs) -> Reply {
        let device = loopdev::LoopDevice {
            image: args.image.clone(),
            read_only: args.read_only,
            info: args.info,
            max_devices: args.max_devices,
            shared: args.shared,
        };
        match device.attach() {
            Ok(index) => {
                self.resources
                    .lock()
                    .unwrap()
                    .loops
                    .push((index, args.image));
                Reply::Index(index)
            }
            Err(err) => Reply::Error(RemoteError::message(err.to_string())),
        }
    }

    fn crypt_open(&self, args: CryptOpenArgs) -> Reply {
        match self.crypt.open(&args.key, &args.loopdev) {
            Ok(name) => {
                self.resources.lock().unwrap().mappers.push(name.clone());
                Reply::Name(name)
            }
            Err(err) => Reply::Error(RemoteError::message(err.to_string())),
        }
    }

    fn crypt_close(&self, args: CryptCloseArgs) -> Reply {
        match self.crypt.close(&args.name) {
            Ok(()) => {
                let mut ledger = self.resources.lock().unwrap();
                ledger.mappers.retain(|name| *name != args.name);
                Reply::Ok
            }
            Err(err) => Reply::Error(RemoteError::message(err.to_string())),
        }
    }

    fn send_fuse_fd(&self) -> (Reply, Vec<RawFd>) {
        match nix::fcntl::open(
            Path::new("/dev/fuse"),
            nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => (Reply::Ok, vec![fd]),
            Err(errno) => (
                Reply::Error(RemoteError::path("open", Path::new("/dev/fuse"), errno)),
                Vec::new(),
            ),
        }
    }

    fn nvccli(&self, args: NvCcliArgs) -> Reply {
        let binary = match find_root_owned_binary("nvidia-container-cli") {
            Ok(path) => path,
            Err(err) => return Reply::Error(RemoteError::message(err.to_string())),
        };

        let mut cmd = Command::new(&binary);
        cmd.args(&args.flags).arg(&args.rootfs_path);
        if args.user_ns {
            // Inside a user namespace the CLI must not try to use
            // cgroups it cannot see.
            cmd.arg("--no-cgroups");
        }
        debug!("running {} {:?}", binary.display(), args.flags);
        match cmd.output() {
            Ok(output) if output.status.success() => Reply::Ok,
            Ok(output) => Reply::Error(RemoteError::message(format!(
                "nvidia-container-cli failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))),
            Err(err) => Reply::Error(RemoteError::message(format!(
                "running {} failed: {err}",
                binary.display()
            ))),
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

/// Locate an external helper and require root ownership before the
/// privileged server will execute it.
fn find_root_owned_binary(name: &str) -> Result<PathBuf> {
    let dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            let owner = std::fs::metadata(&candidate)?.uid();
            if owner != 0 {
                return Err(StarterError::Privilege(format!(
                    "{} must be owned by root",
                    candidate.display()
                )));
            }
            return Ok(candidate);
        }
    }
    Err(StarterError::Config(format!("{name} not found in PATH")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_unwinds_mounts_in_reverse_order() {
        let mut ledger = ResourceLedger::default();
        ledger.mounts.push(PathBuf::from("/mnt/a"));
        ledger.mounts.push(PathBuf::from("/mnt/a/b"));
        // Teardown pops the innermost mount first; both unmounts fail
        // harmlessly here because nothing is mounted.
        ledger.teardown(&CryptDevice::default());
        assert!(ledger.mounts.is_empty());
        assert!(ledger.mappers.is_empty());
        assert!(ledger.loops.is_empty());
    }
}
