//! Unix user and group lookup.
//!
//! Inside a user namespace with custom mappings the password database
//! no longer describes the invoking user, so the master records the
//! pre-namespace identity in a process-wide set-once cell that the
//! stages consult instead of the database.

use crate::config::types::{Result, StarterError};
use nix::unistd::{self, Gid, Uid};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

/// A Unix user account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub dir: PathBuf,
    pub shell: PathBuf,
}

/// A Unix group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

impl From<unistd::User> for User {
    fn from(u: unistd::User) -> Self {
        User {
            name: u.name,
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
            gecos: u.gecos.to_string_lossy().into_owned(),
            dir: u.dir,
            shell: u.shell,
        }
    }
}

impl From<unistd::Group> for Group {
    fn from(g: unistd::Group) -> Self {
        Group {
            name: g.name,
            gid: g.gid.as_raw(),
        }
    }
}

/// Look up a user by uid.
pub fn get_pw_uid(uid: u32) -> Result<User> {
    unistd::User::from_uid(Uid::from_raw(uid))
        .map_err(|e| StarterError::Config(format!("user lookup for uid {uid} failed: {e}")))?
        .map(User::from)
        .ok_or_else(|| StarterError::Config(format!("no user entry for uid {uid}")))
}

/// Look up a user by name.
pub fn get_pw_nam(name: &str) -> Result<User> {
    unistd::User::from_name(name)
        .map_err(|e| StarterError::Config(format!("user lookup for {name} failed: {e}")))?
        .map(User::from)
        .ok_or_else(|| StarterError::Config(format!("no user entry for {name}")))
}

/// Look up a group by gid.
pub fn get_gr_gid(gid: u32) -> Result<Group> {
    unistd::Group::from_gid(Gid::from_raw(gid))
        .map_err(|e| StarterError::Config(format!("group lookup for gid {gid} failed: {e}")))?
        .map(Group::from)
        .ok_or_else(|| StarterError::Config(format!("no group entry for gid {gid}")))
}

/// Look up a group by name.
pub fn get_gr_nam(name: &str) -> Result<Group> {
    unistd::Group::from_name(name)
        .map_err(|e| StarterError::Config(format!("group lookup for {name} failed: {e}")))?
        .map(Group::from)
        .ok_or_else(|| StarterError::Config(format!("no group entry for {name}")))
}

/// The user owning the current process.
pub fn current() -> Result<User> {
    get_pw_uid(unistd::getuid().as_raw())
}

static CURRENT_ORIGINAL: OnceLock<User> = OnceLock::new();

/// Record the pre-namespace identity of the invoking user. Writers set
/// this once during startup; later calls are ignored.
pub fn set_current_original(user: User) {
    let _ = CURRENT_ORIGINAL.set(user);
}

/// Identity of the invoking user as seen from the host.
///
/// Returns the recorded original user when one was set, otherwise maps
/// the current uid back through `/proc/self/uid_map` and looks it up.
pub fn current_original() -> Result<User> {
    if let Some(user) = CURRENT_ORIGINAL.get() {
        return Ok(user.clone());
    }
    get_pw_uid(host_uid()?)
}

/// Host-side uid of the current process, resolved through the user
/// namespace uid map when one is in effect.
pub fn host_uid() -> Result<u32> {
    let uid = unistd::getuid().as_raw();
    let map = std::fs::read_to_string("/proc/self/uid_map")?;
    map_to_host(&map, uid)
        .ok_or_else(|| StarterError::Config(format!("uid {uid} has no host mapping")))
}

/// Resolve `uid` through the content of a uid_map file.
fn map_to_host(map: &str, uid: u32) -> Option<u32> {
    for line in map.lines() {
        let mut fields = line.split_whitespace();
        let inside: u32 = fields.next()?.parse().ok()?;
        let outside: u32 = fields.next()?.parse().ok()?;
        let count: u32 = fields.next()?.parse().ok()?;
        if uid >= inside && uid - inside < count {
            return Some(outside + (uid - inside));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_user_resolves() {
        let user = current().unwrap();
        assert_eq!(user.uid, unistd::getuid().as_raw());
        assert!(!user.name.is_empty());
    }

    #[test]
    fn identity_uid_map_resolves_to_self() {
        // The identity mapping used outside user namespaces.
        let map = "         0          0 4294967295\n";
        assert_eq!(map_to_host(map, 1000), Some(1000));
        assert_eq!(map_to_host(map, 0), Some(0));
    }

    #[test]
    fn offset_uid_map_translates() {
        let map = "0 100000 65536\n";
        assert_eq!(map_to_host(map, 0), Some(100000));
        assert_eq!(map_to_host(map, 1000), Some(101000));
        assert_eq!(map_to_host(map, 70000), None);
    }

    #[test]
    fn original_user_cell_is_set_once() {
        let first = User {
            name: "first".into(),
            uid: 1,
            gid: 1,
            gecos: String::new(),
            dir: "/".into(),
            shell: "/bin/sh".into(),
        };
        let second = User {
            name: "second".into(),
            ..first.clone()
        };
        set_current_original(first.clone());
        set_current_original(second);
        assert_eq!(current_original().unwrap().name, "first");
    }
}
