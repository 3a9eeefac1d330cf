//! Stage-1 and stage-2.
//!
//! Stage-1 runs as the forked child of the master: it reconstructs the
//! engine from the inherited config descriptor, creates the requested
//! namespaces, and drives container creation over RPC. It then morphs
//! into stage-2, which writes the start barrier and replaces itself
//! with the container payload.

use crate::config::types::Result;
use crate::core::types::{BARRIER_CONTINUE, BARRIER_FATAL};
use crate::engine::Engine;
use crate::kernel::namespace;
use crate::rpc::RpcClient;
use crate::utils::user;
use log::{debug, error};
use nix::unistd::getpid;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Entry point of the forked child. Never returns: on success the
/// payload replaces the process, on failure the fatal barrier byte is
/// written and the process exits non-zero.
pub fn stage1_main(config_fd: RawFd, rpc_fd: RawFd, master_fd: RawFd) -> ! {
    // Safety: master_fd is an owned socket descriptor inherited from
    // the fork.
    let mut master = unsafe { UnixStream::from_raw_fd(master_fd) };

    match run_stages(config_fd, rpc_fd, &mut master) {
        Ok(never) => match never {},
        Err(err) => {
            error!("{err}");
            let _ = master.write_all(&[BARRIER_FATAL]);
            std::process::exit(255);
        }
    }
}

fn run_stages(
    config_fd: RawFd,
    rpc_fd: RawFd,
    master: &mut UnixStream,
) -> Result<std::convert::Infallible> {
    namespace::set_parent_death_signal()?;

    let mut blob = Vec::new();
    {
        // Safety: config_fd is the owned read end of the config pipe.
        let mut config = unsafe { std::fs::File::from_raw_fd(config_fd) };
        config.read_to_end(&mut blob)?;
    }
    let engine = Engine::deserialize(&blob)?;
    user::set_current_original(engine.common.original_user.clone());

    namespace::unshare_namespaces(engine.common.namespaces)?;

    {
        let mut rpc = RpcClient::new(rpc_fd);
        engine
            .operations
            .create_container(getpid(), &mut rpc)?;
        // Dropping the client closes our end of the RPC socket; the
        // master's serve loop ends on the EOF.
    }

    // Stage-1 morphs into stage-2 inside the new namespaces.
    debug!("container creation complete, entering stage 2");
    master.write_all(&[BARRIER_CONTINUE])?;
    master.flush()?;

    engine.operations.start_process(master)
}
