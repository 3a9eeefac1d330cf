//! Stage-side RPC client.
//!
//! One typed method per privileged operation. Calls are strictly
//! serialized: each sends a single request and blocks for its reply,
//! so replies always arrive in request order.

use crate::config::types::{Result, StarterError};
use crate::kernel::loopdev::LoopInfo;
use crate::rpc::types::*;
use crate::rpc::wire;
use nix::unistd::close;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Client half of the inherited RPC socket pair.
pub struct RpcClient {
    fd: RawFd,
}

impl RpcClient {
    pub fn new(fd: RawFd) -> Self {
        RpcClient { fd }
    }

    fn call(&mut self, request: &Request) -> Result<(Reply, Vec<RawFd>)> {
        wire::send_message(self.fd, request, &[])?;
        wire::recv_message::<Reply>(self.fd)?
            .ok_or_else(|| StarterError::Rpc("server closed the connection".to_string()))
    }

    fn unit(&mut self, request: &Request) -> Result<()> {
        match self.call(request)?.0 {
            Reply::Ok => Ok(()),
            Reply::Error(err) => Err(err.into()),
            other => Err(protocol_error(request, &other)),
        }
    }

    pub fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.unit(&Request::Mkdir(MkdirArgs {
            path: path.to_path_buf(),
            mode,
        }))
    }

    pub fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        filesystem: Option<&str>,
        flags: u64,
        data: Option<&str>,
    ) -> Result<()> {
        self.unit(&Request::Mount(MountArgs {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            filesystem: filesystem.map(str::to_string),
            flags,
            data: data.map(str::to_string),
        }))
    }

    pub fn unmount(&mut self, target: &Path, flags: i32) -> Result<()> {
        self.unit(&Request::Unmount(UnmountArgs {
            target: target.to_path_buf(),
            flags,
        }))
    }

    pub fn chroot(&mut self, root: &Path, method: &str) -> Result<()> {
        self.unit(&Request::Chroot(ChrootArgs {
            root: root.to_path_buf(),
            method: method.to_string(),
        }))
    }

    pub fn chdir(&mut self, dir: &Path) -> Result<()> {
        self.unit(&Request::Chdir(ChdirArgs {
            dir: dir.to_path_buf(),
        }))
    }

    pub fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        self.unit(&Request::Symlink(SymlinkArgs {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        }))
    }

    pub fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.unit(&Request::Chown(ChownArgs {
            path: path.to_path_buf(),
            uid,
            gid,
            follow_symlink: true,
        }))
    }

    pub fn lchown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        self.unit(&Request::Chown(ChownArgs {
            path: path.to_path_buf(),
            uid,
            gid,
            follow_symlink: false,
        }))
    }

    pub fn readdir(&mut self, dir: &Path) -> Result<Vec<DirEntrySnapshot>> {
        let request = Request::Readdir(ReaddirArgs {
            dir: dir.to_path_buf(),
        });
        match self.call(&request)?.0 {
            Reply::Entries(entries) => Ok(entries),
            Reply::Error(err) => Err(err.into()),
            other => Err(protocol_error(&request, &other)),
        }
    }

    pub fn readlink(&mut self, path: &Path) -> Result<PathBuf> {
        let request = Request::Readlink(ReadlinkArgs {
            path: path.to_path_buf(),
        });
        match self.call(&request)?.0 {
            Reply::Path(target) => Ok(target),
            Reply::Error(err) => Err(err.into()),
            other => Err(protocol_error(&request, &other)),
        }
    }

    pub fn stat(&mut self, path: &Path) -> Result<StatReply> {
        let request = Request::Stat(StatArgs {
            path: path.to_path_buf(),
        });
        match self.call(&request)?.0 {
            Reply::Stat(reply) => Ok(reply),
            Reply::Error(err) => Err(err.into()),
            other => Err(protocol_error(&request, &other)),
        }
    }

    pub fn access(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.unit(&Request::Access(AccessArgs {
            path: path.to_path_buf(),
            mode,
        }))
    }

    pub fn write_file(&mut self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        self.unit(&Request::WriteFile(WriteFileArgs {
            path: path.to_path_buf(),
            data: data.to_vec(),
            mode,
        }))
    }

    pub fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        self.unit(&Request::SetHostname(HostnameArgs {
            hostname: hostname.to_string(),
        }))
    }

    /// Set the server's umask, returning the previous mask.
    pub fn umask(&mut self, mask: u32) -> Result<u32> {
        let request = Request::Umask(UmaskArgs { mask });
        match self.call(&request)?.0 {
            Reply::Mask(old) => Ok(old),
            Reply::Error(err) => Err(err.into()),
            other => Err(protocol_error(&request, &other)),
        }
    }

    /// Attach an image to a loop device, returning the device index.
    pub fn loop_attach(
        &mut self,
        image: &Path,
        read_only: bool,
        info: LoopInfo,
        max_devices: u32,
        shared: bool,
    ) -> Result<u32> {
        let request = Request::LoopAttach(LoopAttachArgs {
            image: image.to_path_buf(),
            read_only,
            info,
            max_devices,
            shared,
        });
        match self.call(&request)?.0 {
            Reply::Index(index) => Ok(index),
            Reply::Error(err) => Err(revive_sentinel(err)),
            other => Err(protocol_error(&request, &other)),
        }
    }

    /// Open an encrypted device, returning its mapper name.
    pub fn crypt_open(&mut self, key: &[u8], loopdev: &Path) -> Result<String> {
        let request = Request::CryptOpen(CryptOpenArgs {
            key: key.to_vec(),
            loopdev: loopdev.to_path_buf(),
        });
        match self.call(&request)?.0 {
            Reply::Name(name) => Ok(name),
            Reply::Error(err) => Err(revive_sentinel(err)),
            other => Err(protocol_error(&request, &other)),
        }
    }

    pub fn crypt_close(&mut self, name: &str) -> Result<()> {
        let request = Request::CryptClose(CryptCloseArgs {
            name: name.to_string(),
        });
        match self.call(&request)?.0 {
            Reply::Ok => Ok(()),
            Reply::Error(err) => Err(revive_sentinel(err)),
            other => Err(protocol_error(&request, &other)),
        }
    }

    /// Ask the server to open `/dev/fuse` and pass the descriptor back
    /// over the socket.
    pub fn send_fuse_fd(&mut self) -> Result<RawFd> {
        let request = Request::SendFuseFd(SendFuseFdArgs {});
        let (reply, mut fds) = self.call(&request)?;
        match reply {
            Reply::Ok => fds
                .pop()
                .ok_or_else(|| StarterError::Rpc("no descriptor attached to reply".to_string())),
            Reply::Error(err) => {
                for fd in fds {
                    let _ = close(fd);
                }
                Err(err.into())
            }
            other => Err(protocol_error(&request, &other)),
        }
    }

    pub fn nvccli(&mut self, flags: &[String], rootfs_path: &Path, user_ns: bool) -> Result<()> {
        self.unit(&Request::NvCcli(NvCcliArgs {
            flags: flags.to_vec(),
            rootfs_path: rootfs_path.to_path_buf(),
            user_ns,
        }))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

fn protocol_error(request: &Request, reply: &Reply) -> StarterError {
    StarterError::Rpc(format!(
        "mismatched reply {reply:?} for request {request:?}"
    ))
}

/// Crypt sentinels travel as message errors; revive them so callers
/// can match on the distinguished variants.
fn revive_sentinel(err: RemoteError) -> StarterError {
    if let RemoteError::Message { text } = &err {
        for sentinel in [
            StarterError::InvalidPassphrase,
            StarterError::UnsupportedCryptsetupVersion,
            StarterError::MapperNamesExhausted,
            StarterError::LoopDevicesExhausted,
        ] {
            if *text == sentinel.to_string() {
                return sentinel;
            }
        }
    }
    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_revive_from_message_errors() {
        let err = revive_sentinel(RemoteError::message("no key available with this passphrase"));
        assert!(matches!(err, StarterError::InvalidPassphrase));

        let err = revive_sentinel(RemoteError::message("no loop devices available"));
        assert!(matches!(err, StarterError::LoopDevicesExhausted));

        let err = revive_sentinel(RemoteError::message("some other failure"));
        assert!(matches!(err, StarterError::Remote(_)));
    }
}
