//! RPC integration tests over a real socket pair.
//!
//! The server half runs in a thread of this process, standing in for
//! the privileged master; the client half issues the same typed calls
//! the stages use.

use cryptbox::config::types::StarterError;
use cryptbox::rpc::types::RemoteError;
use cryptbox::rpc::{ResourceLedger, RpcClient, RpcServer};
use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::stat::lstat;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

struct Harness {
    client: RpcClient,
    server: JoinHandle<Result<(), StarterError>>,
    resources: Arc<Mutex<ResourceLedger>>,
}

fn start_harness() -> Harness {
    let (server_fd, client_fd) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .unwrap();

    let resources = Arc::new(Mutex::new(ResourceLedger::default()));
    let server_resources = resources.clone();
    let server = std::thread::spawn(move || {
        let mut server = RpcServer::new(server_fd, server_resources);
        server.serve()
    });

    Harness {
        client: RpcClient::new(client_fd),
        server,
        resources,
    }
}

impl Harness {
    fn finish(self) {
        drop(self.client);
        self.server.join().unwrap().unwrap();
    }
}

#[test]
fn mkdir_stat_and_local_lstat_agree() {
    let tmp = tempfile::tempdir().unwrap();
    let mut harness = start_harness();

    let dir = tmp.path().join("made-by-rpc");
    harness.client.mkdir(&dir, 0o750).unwrap();
    assert!(dir.is_dir());

    let remote = harness.client.stat(&dir).unwrap();
    let local = lstat(&dir).unwrap();
    assert_eq!(remote.stat.ino, local.st_ino);
    assert_eq!(remote.stat.mode, local.st_mode);
    assert_eq!(remote.stat.size, local.st_size);
    assert_eq!(remote.stat.mtime_sec, local.st_mtime);
    assert_eq!(remote.info.name, "made-by-rpc");
    assert!(remote.info.is_dir);

    harness.finish();
}

#[test]
fn write_file_then_stat_sees_the_content() {
    let tmp = tempfile::tempdir().unwrap();
    let mut harness = start_harness();

    let file = tmp.path().join("resolv.conf");
    harness
        .client
        .write_file(&file, b"nameserver 10.0.0.1\n", 0o644)
        .unwrap();

    let remote = harness.client.stat(&file).unwrap();
    assert_eq!(remote.stat.size, 20);
    assert!(!remote.info.is_dir);
    assert_eq!(std::fs::read(&file).unwrap(), b"nameserver 10.0.0.1\n");

    harness.finish();
}

#[test]
fn symlink_and_readlink_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let mut harness = start_harness();

    let link = tmp.path().join("link");
    harness
        .client
        .symlink(Path::new("/etc/hosts"), &link)
        .unwrap();
    let target = harness.client.readlink(&link).unwrap();
    assert_eq!(target, Path::new("/etc/hosts"));

    harness.finish();
}

#[test]
fn readdir_returns_sorted_entries_with_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("beta"), b"bb").unwrap();
    std::fs::write(tmp.path().join("alpha"), b"a").unwrap();
    std::fs::create_dir(tmp.path().join("gamma")).unwrap();

    let mut harness = start_harness();
    let entries = harness.client.readdir(tmp.path()).unwrap();

    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    assert_eq!(entries[0].info.size, 1);
    assert_eq!(entries[1].info.size, 2);
    assert_eq!(entries[2].file_type, libc::S_IFDIR);
    assert!(entries[2].info.is_dir);

    harness.finish();
}

#[test]
fn remote_errors_carry_the_original_errno() {
    let mut harness = start_harness();

    let err = harness
        .client
        .stat(Path::new("/definitely/not/here"))
        .unwrap_err();
    match &err {
        StarterError::Remote(RemoteError::Path { op, errno, .. }) => {
            assert_eq!(op, "stat");
            assert_eq!(*errno, Errno::ENOENT as i32);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The remote errno rebuilds the identical local error.
    if let StarterError::Remote(remote) = err {
        assert_eq!(remote.to_io_error().kind(), std::io::ErrorKind::NotFound);
    }

    let err = harness
        .client
        .access(Path::new("/definitely/not/here"), 0)
        .unwrap_err();
    assert_eq!(err.errno(), Some(Errno::ENOENT as i32));

    harness.finish();
}

#[test]
fn umask_returns_the_previous_mask() {
    let mut harness = start_harness();

    let original = harness.client.umask(0o027).unwrap();
    let previous = harness.client.umask(original).unwrap();
    assert_eq!(previous, 0o027);

    harness.finish();
}

#[test]
fn mounts_are_recorded_in_the_ledger() {
    let mut harness = start_harness();

    // Without privileges the mount itself fails, but the failure path
    // must leave the ledger untouched.
    if !nix::unistd::geteuid().is_root() {
        let tmp = tempfile::tempdir().unwrap();
        let err = harness
            .client
            .mount(None, tmp.path(), Some("tmpfs"), 0, None)
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM as i32));
        assert!(harness.resources.lock().unwrap().mounts.is_empty());
    }

    harness.finish();
}

#[test]
fn loop_attach_on_missing_image_reports_a_message_error() {
    let mut harness = start_harness();

    let err = harness
        .client
        .loop_attach(
            Path::new("/definitely/not/here.sif"),
            true,
            Default::default(),
            4,
            false,
        )
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
    assert!(harness.resources.lock().unwrap().loops.is_empty());

    harness.finish();
}

#[test]
fn fuse_fd_arrives_or_fails_with_the_device_error() {
    let mut harness = start_harness();

    match harness.client.send_fuse_fd() {
        Ok(fd) => {
            // A descriptor for /dev/fuse was transferred over the
            // socket; it is a fresh fd in this process.
            assert!(fd >= 0);
            let _ = nix::unistd::close(fd);
        }
        Err(StarterError::Remote(RemoteError::Path { op, path, .. })) => {
            assert_eq!(op, "open");
            assert_eq!(path, Path::new("/dev/fuse"));
        }
        Err(other) => panic!("unexpected error: {other:?}"),
    }

    harness.finish();
}
