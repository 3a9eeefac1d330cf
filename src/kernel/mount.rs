//! Mount and unmount wrappers.
//!
//! Flags cross the RPC boundary as raw bit masks, so the wrappers
//! accept integers and rebuild the typed flag sets on this side.
//! Errors are returned as raw errnos; each caller attaches its own
//! context.

use log::debug;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::Path;

/// Mount a filesystem.
pub fn mount_filesystem(
    source: Option<&Path>,
    target: &Path,
    filesystem: Option<&str>,
    flags: u64,
    data: Option<&str>,
) -> nix::Result<()> {
    let ms_flags = MsFlags::from_bits_truncate(flags as libc::c_ulong);
    debug!(
        "mounting {} at {} (type {:?}, flags {:#x})",
        source.map(|p| p.display().to_string()).unwrap_or_default(),
        target.display(),
        filesystem,
        flags
    );
    mount(source, target, filesystem, ms_flags, data)
}

/// Unmount a target path.
pub fn unmount(target: &Path, flags: i32) -> nix::Result<()> {
    let mnt_flags = MntFlags::from_bits_truncate(flags);
    debug!("unmounting {} (flags {:#x})", target.display(), flags);
    umount2(target, mnt_flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn mount_without_privileges_reports_eperm() {
        if nix::unistd::geteuid().is_root() {
            // Meaningful only for unprivileged runs.
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let err = mount_filesystem(None, tmp.path(), Some("tmpfs"), 0, None).unwrap_err();
        assert_eq!(err, Errno::EPERM);
    }
}
