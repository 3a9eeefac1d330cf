//! Namespace creation and root switching.

use crate::config::types::{NamespaceFlags, Result, StarterError};
use log::debug;
use nix::mount::{umount2, MntFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, chroot, pivot_root};
use std::path::Path;

/// Root-switch methods supported by the chroot RPC operation.
pub const CHROOT_METHOD: &str = "chroot";
pub const PIVOT_METHOD: &str = "pivot";

fn clone_flags(flags: NamespaceFlags) -> CloneFlags {
    let mut set = CloneFlags::empty();
    if flags.pid {
        set |= CloneFlags::CLONE_NEWPID;
    }
    if flags.mount {
        set |= CloneFlags::CLONE_NEWNS;
    }
    if flags.network {
        set |= CloneFlags::CLONE_NEWNET;
    }
    if flags.user {
        set |= CloneFlags::CLONE_NEWUSER;
    }
    if flags.ipc {
        set |= CloneFlags::CLONE_NEWIPC;
    }
    if flags.uts {
        set |= CloneFlags::CLONE_NEWUTS;
    }
    set
}

/// Unshare into the namespaces the engine selected. A user namespace,
/// when requested, is created in the same call so the remaining
/// namespaces are owned by it.
pub fn unshare_namespaces(flags: NamespaceFlags) -> Result<()> {
    if flags.is_empty() {
        return Ok(());
    }
    let set = clone_flags(flags);
    debug!("unsharing namespaces: {set:?}");
    unshare(set).map_err(|e| StarterError::Namespace(format!("unshare failed: {e}")))
}

/// Switch the root directory using the requested method.
pub fn enter_root(root: &Path, method: &str) -> Result<()> {
    match method {
        CHROOT_METHOD => {
            chroot(root)
                .map_err(|e| StarterError::Namespace(format!("chroot to {} failed: {e}", root.display())))?;
            chdir("/").map_err(|e| StarterError::Namespace(format!("chdir to / failed: {e}")))
        }
        PIVOT_METHOD => {
            chdir(root).map_err(|e| {
                StarterError::Namespace(format!("chdir to {} failed: {e}", root.display()))
            })?;
            // Stack the new root over itself so no put_old directory is
            // needed, then drop the old root from the mount table.
            pivot_root(".", ".")
                .map_err(|e| StarterError::Namespace(format!("pivot_root failed: {e}")))?;
            umount2(".", MntFlags::MNT_DETACH)
                .map_err(|e| StarterError::Namespace(format!("detaching old root failed: {e}")))?;
            chdir("/").map_err(|e| StarterError::Namespace(format!("chdir to / failed: {e}")))
        }
        other => Err(StarterError::Config(format!(
            "unknown chroot method {other}"
        ))),
    }
}

/// Kill this process when its parent dies. The master and both stages
/// install this before entering their main loops; the flag does not
/// survive a fork, so each process sets its own.
pub fn set_parent_death_signal() -> Result<()> {
    // Safety: plain prctl with integer arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
    if rc != 0 {
        return Err(StarterError::Process(format!(
            "prctl(PR_SET_PDEATHSIG) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flags_cover_each_namespace() {
        let all = NamespaceFlags {
            pid: true,
            mount: true,
            network: true,
            user: true,
            ipc: true,
            uts: true,
        };
        let set = clone_flags(all);
        for flag in [
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWNET,
            CloneFlags::CLONE_NEWUSER,
            CloneFlags::CLONE_NEWIPC,
            CloneFlags::CLONE_NEWUTS,
        ] {
            assert!(set.contains(flag));
        }
        assert!(clone_flags(NamespaceFlags::none()).is_empty());
    }

    #[test]
    fn unknown_root_method_is_rejected() {
        let err = enter_root(Path::new("/"), "teleport").unwrap_err();
        assert!(err.to_string().contains("unknown chroot method"));
    }

    #[test]
    fn parent_death_signal_installs() {
        set_parent_death_signal().unwrap();
    }
}
