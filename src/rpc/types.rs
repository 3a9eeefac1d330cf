//! RPC argument and reply records.
//!
//! Requests and replies are tagged unions; errors are a registered sum
//! type covering path errors, link errors, syscall errors, raw errnos,
//! and an opaque string fallback, all carrying enough to rebuild the
//! equivalent `std::io::Error` on the peer.

use crate::kernel::loopdev::LoopInfo;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Portable error for RPC replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteError {
    /// A failed operation on one path.
    Path {
        op: String,
        path: PathBuf,
        errno: i32,
    },
    /// A failed operation linking two paths.
    Link {
        op: String,
        old: PathBuf,
        new: PathBuf,
        errno: i32,
    },
    /// A failed syscall without path context.
    Syscall { call: String, errno: i32 },
    /// A bare errno.
    Errno { errno: i32 },
    /// Fallback for errors with no structured representation.
    Message { text: String },
}

impl RemoteError {
    pub fn path(op: &str, path: &Path, errno: Errno) -> Self {
        RemoteError::Path {
            op: op.to_string(),
            path: path.to_path_buf(),
            errno: errno as i32,
        }
    }

    pub fn link(op: &str, old: &Path, new: &Path, errno: Errno) -> Self {
        RemoteError::Link {
            op: op.to_string(),
            old: old.to_path_buf(),
            new: new.to_path_buf(),
            errno: errno as i32,
        }
    }

    pub fn syscall(call: &str, errno: Errno) -> Self {
        RemoteError::Syscall {
            call: call.to_string(),
            errno: errno as i32,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        RemoteError::Message { text: text.into() }
    }

    /// The raw errno attached to this error, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            RemoteError::Path { errno, .. }
            | RemoteError::Link { errno, .. }
            | RemoteError::Syscall { errno, .. }
            | RemoteError::Errno { errno } => Some(*errno),
            RemoteError::Message { .. } => None,
        }
    }

    /// Rebuild the local equivalent of this error.
    pub fn to_io_error(&self) -> std::io::Error {
        match self.errno() {
            Some(errno) => std::io::Error::from_raw_os_error(errno),
            None => std::io::Error::new(std::io::ErrorKind::Other, self.to_string()),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Path { op, path, errno } => {
                write!(f, "{op} {}: {}", path.display(), Errno::from_i32(*errno))
            }
            RemoteError::Link {
                op,
                old,
                new,
                errno,
            } => write!(
                f,
                "{op} {} {}: {}",
                old.display(),
                new.display(),
                Errno::from_i32(*errno)
            ),
            RemoteError::Syscall { call, errno } => {
                write!(f, "{call}: {}", Errno::from_i32(*errno))
            }
            RemoteError::Errno { errno } => write!(f, "{}", Errno::from_i32(*errno)),
            RemoteError::Message { text } => f.write_str(text),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Snapshot of a `stat` result, field-for-field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
}

impl From<&libc::stat> for StatSnapshot {
    fn from(st: &libc::stat) -> Self {
        StatSnapshot {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u64,
            size: st.st_size as i64,
            blksize: st.st_blksize as i64,
            blocks: st.st_blocks as i64,
            atime_sec: st.st_atime as i64,
            atime_nsec: st.st_atime_nsec as i64,
            mtime_sec: st.st_mtime as i64,
            mtime_nsec: st.st_mtime_nsec as i64,
            ctime_sec: st.st_ctime as i64,
            ctime_nsec: st.st_ctime_nsec as i64,
        }
    }
}

/// Snapshot of file metadata, the RPC analogue of `FileInfo`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoSnapshot {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub is_dir: bool,
}

impl FileInfoSnapshot {
    pub fn from_stat(name: &str, st: &StatSnapshot) -> Self {
        FileInfoSnapshot {
            name: name.to_string(),
            size: st.size,
            mode: st.mode,
            mtime_sec: st.mtime_sec,
            mtime_nsec: st.mtime_nsec,
            is_dir: st.mode & libc::S_IFMT == libc::S_IFDIR,
        }
    }

    /// Modification time; a zero timestamp resolves to the current
    /// time rather than the epoch.
    pub fn modified(&self) -> SystemTime {
        if self.mtime_sec == 0 && self.mtime_nsec == 0 {
            return SystemTime::now();
        }
        UNIX_EPOCH
            + Duration::new(
                self.mtime_sec.max(0) as u64,
                self.mtime_nsec.clamp(0, 999_999_999) as u32,
            )
    }
}

/// One directory entry with its metadata snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntrySnapshot {
    pub name: String,
    /// File type bits (the `S_IFMT` part of the mode).
    pub file_type: u32,
    pub info: FileInfoSnapshot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirArgs {
    pub path: PathBuf,
    pub mode: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgs {
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub filesystem: Option<String>,
    pub flags: u64,
    pub data: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountArgs {
    pub target: PathBuf,
    pub flags: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootArgs {
    pub root: PathBuf,
    /// One of the methods understood by `kernel::namespace::enter_root`.
    pub method: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChdirArgs {
    pub dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkArgs {
    pub target: PathBuf,
    pub link: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChownArgs {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// False performs lchown on the link itself.
    pub follow_symlink: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaddirArgs {
    pub dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadlinkArgs {
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatArgs {
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessArgs {
    pub path: PathBuf,
    pub mode: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileArgs {
    pub path: PathBuf,
    pub data: Vec<u8>,
    pub mode: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameArgs {
    pub hostname: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UmaskArgs {
    pub mask: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopAttachArgs {
    pub image: PathBuf,
    pub read_only: bool,
    pub info: LoopInfo,
    pub max_devices: u32,
    pub shared: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptOpenArgs {
    pub key: Vec<u8>,
    /// Block device holding the LUKS2 payload. The partition offset is
    /// already applied by the loop attachment backing this device.
    pub loopdev: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptCloseArgs {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFuseFdArgs {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvCcliArgs {
    pub flags: Vec<String>,
    pub rootfs_path: PathBuf,
    pub user_ns: bool,
}

/// One RPC request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Request {
    Mkdir(MkdirArgs),
    Mount(MountArgs),
    Unmount(UnmountArgs),
    Chroot(ChrootArgs),
    Chdir(ChdirArgs),
    Symlink(SymlinkArgs),
    Chown(ChownArgs),
    Readdir(ReaddirArgs),
    Readlink(ReadlinkArgs),
    Stat(StatArgs),
    Access(AccessArgs),
    WriteFile(WriteFileArgs),
    SetHostname(HostnameArgs),
    Umask(UmaskArgs),
    LoopAttach(LoopAttachArgs),
    CryptOpen(CryptOpenArgs),
    CryptClose(CryptCloseArgs),
    SendFuseFd(SendFuseFdArgs),
    NvCcli(NvCcliArgs),
}

/// Stat reply: the metadata snapshot plus the raw stat record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatReply {
    pub info: FileInfoSnapshot,
    pub stat: StatSnapshot,
}

/// One RPC reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Error(RemoteError),
    Index(u32),
    Name(String),
    Mask(u32),
    Path(PathBuf),
    Stat(StatReply),
    Entries(Vec<DirEntrySnapshot>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_errors_round_trip_identically() {
        let errors = vec![
            RemoteError::path("mkdir", Path::new("/tmp/x"), Errno::EEXIST),
            RemoteError::link(
                "symlink",
                Path::new("/a"),
                Path::new("/b"),
                Errno::EPERM,
            ),
            RemoteError::syscall("sethostname", Errno::EPERM),
            RemoteError::Errno {
                errno: Errno::ENOENT as i32,
            },
            RemoteError::message("device not available"),
        ];
        for err in errors {
            let encoded = serde_json::to_vec(&err).unwrap();
            let decoded: RemoteError = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(err, decoded);
        }
    }

    #[test]
    fn remote_enoent_matches_local_enoent() {
        let err = RemoteError::path("stat", Path::new("/missing"), Errno::ENOENT);
        let io_err = err.to_io_error();
        assert_eq!(io_err.kind(), std::io::ErrorKind::NotFound);
        assert_eq!(io_err.raw_os_error(), Some(Errno::ENOENT as i32));
    }

    #[test]
    fn request_encoding_is_tagged() {
        let req = Request::Mkdir(MkdirArgs {
            path: PathBuf::from("/tmp/dir"),
            mode: 0o755,
        });
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["op"], "mkdir");
        assert_eq!(value["args"]["mode"], 0o755);
        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn zero_mtime_resolves_to_now() {
        let info = FileInfoSnapshot::default();
        let resolved = info.modified();
        assert!(resolved > UNIX_EPOCH + Duration::from_secs(1_000_000));
    }

    #[test]
    fn stat_snapshot_survives_the_wire() {
        let stat = StatSnapshot {
            dev: 5,
            ino: 42,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 1 << 20,
            blksize: 4096,
            blocks: 2048,
            atime_sec: 1_700_000_000,
            atime_nsec: 1,
            mtime_sec: 1_700_000_001,
            mtime_nsec: 2,
            ctime_sec: 1_700_000_002,
            ctime_nsec: 3,
        };
        let reply = Reply::Stat(StatReply {
            info: FileInfoSnapshot::from_stat("image.sif", &stat),
            stat: stat.clone(),
        });
        let encoded = serde_json::to_vec(&reply).unwrap();
        let decoded: Reply = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(reply, decoded);
        match decoded {
            Reply::Stat(s) => {
                assert_eq!(s.stat, stat);
                assert!(!s.info.is_dir);
                assert_eq!(s.info.name, "image.sif");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
