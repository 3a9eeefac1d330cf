//! Master orchestration.
//!
//! The master prepares the engine, forks stage-1, and runs three
//! concurrent tasks: the privileged RPC server, the start-barrier
//! synchronizer, and the container monitor. The first error from any
//! task wins the fatal channel; cleanup runs strictly after that
//! receive, so it never races container start.

use crate::config::types::{Result, StarterError};
use crate::core::stage;
use crate::core::types::{barrier_outcome, BarrierOutcome, ContainerStatus};
use crate::crypt::CryptDevice;
use crate::engine::Engine;
use crate::kernel::{namespace, signal};
use crate::rpc::{ResourceLedger, RpcServer};
use crate::utils::{mainthread, user};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, pipe2, ForkResult, Pid};
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type FatalSender = Sender<Option<StarterError>>;

/// Launch a prepared engine and never return. The calling thread must
/// be the main thread; it parks in the dispatcher so signal re-raise
/// and exec marshaling run on it.
pub fn boot(engine: Engine) -> ! {
    let main = mainthread::init();
    std::thread::spawn(move || {
        let err = run(engine);
        error!("{err}");
        std::process::exit(255);
    });
    main.park();
    // The dispatcher only drains if every sender vanished without
    // exiting the process; treat that as a setup failure.
    std::process::exit(255);
}

/// Orchestrate the three-process launch. Returns only on error; every
/// success path terminates the process with the container's status.
fn run(engine: Engine) -> StarterError {
    match orchestrate(engine) {
        Ok(never) => match never {},
        Err(err) => err,
    }
}

fn orchestrate(mut engine: Engine) -> Result<std::convert::Infallible> {
    // The death signal is not inherited across fork; stage-1 installs
    // its own copy after the fork below.
    namespace::set_parent_death_signal()?;

    let flags = engine.operations.prepare_config(&mut engine.common)?;
    engine.common.namespaces = flags;
    user::set_current_original(engine.common.original_user.clone());

    let blob = engine.serialize()?;

    let (config_read, config_write) = pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .map_err(|e| StarterError::Process(format!("pipe(config) failed: {e}")))?;
    let (rpc_parent, rpc_child) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| StarterError::Process(format!("socketpair(rpc) failed: {e}")))?;
    let (master_parent, master_child) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| StarterError::Process(format!("socketpair(master) failed: {e}")))?;

    let container_pid = match unsafe { fork() }
        .map_err(|e| StarterError::Process(format!("fork(stage-1) failed: {e}")))?
    {
        ForkResult::Child => {
            let _ = close(config_write);
            let _ = close(rpc_parent);
            let _ = close(master_parent);
            stage::stage1_main(config_read, rpc_child, master_child);
        }
        ForkResult::Parent { child } => child,
    };

    let _ = close(config_read);
    let _ = close(rpc_child);
    let _ = close(master_child);

    debug!("stage-1 running as pid {container_pid}");

    // Signals can arrive from the child as soon as it runs (and a dead
    // child turns the config write below into SIGPIPE); queue
    // everything until the monitor takes over.
    let signals = signal::install_queue()?;

    // Hand the serialized engine to stage-1; closing the write end
    // gives the child its EOF.
    {
        // Safety: config_write is an owned pipe descriptor.
        let mut config = unsafe { std::fs::File::from_raw_fd(config_write) };
        config.write_all(&blob)?;
    }

    let engine = Arc::new(engine);

    let status = Arc::new(Mutex::new(ContainerStatus::Running));
    let resources = Arc::new(Mutex::new(ResourceLedger::default()));
    let (fatal_tx, fatal_rx): (FatalSender, Receiver<Option<StarterError>>) = bounded(1);

    // Container-create task: serve RPC until stage-1 closes its end.
    {
        let fatal_tx = fatal_tx.clone();
        let resources = resources.clone();
        std::thread::spawn(move || {
            let mut server = RpcServer::new(rpc_parent, resources);
            if let Err(err) = server.serve() {
                let _ = fatal_tx.send(Some(StarterError::Process(format!(
                    "container creation failed: {err}"
                ))));
            }
        });
    }

    // Start-synchronizer task: drive the barrier protocol.
    {
        let fatal_tx = fatal_tx.clone();
        let engine = engine.clone();
        // Safety: master_parent is an owned socket descriptor.
        let master = unsafe { UnixStream::from_raw_fd(master_parent) };
        std::thread::spawn(move || start_synchronizer(master, engine, container_pid, fatal_tx));
    }

    // Monitor task: the only writer of status.
    {
        let fatal_tx = fatal_tx.clone();
        let engine = engine.clone();
        let status = status.clone();
        std::thread::spawn(move || {
            match engine.operations.monitor_container(container_pid, &signals) {
                Ok(final_status) => {
                    *status.lock().unwrap() = final_status;
                    let _ = fatal_tx.send(None);
                }
                Err(err) => {
                    let _ = fatal_tx.send(Some(err));
                }
            }
        });
    }

    let fatal = fatal_rx
        .recv()
        .unwrap_or_else(|_| Some(StarterError::Process("fatal channel closed".to_string())));

    let final_status = *status.lock().unwrap();

    // Cleanup never masks the root cause: errors are logged only.
    if let Err(err) = engine
        .operations
        .cleanup_container(fatal.as_ref(), final_status)
    {
        error!("container cleanup failed: {err}");
    }
    resources.lock().unwrap().teardown(&CryptDevice::default());

    if let Some(err) = fatal {
        return Err(err);
    }

    signal::reset_handlers();

    match final_status {
        ContainerStatus::Signaled(signum) => {
            debug!("child exited due to signal {signum}");
            if let Ok(sig) = Signal::try_from(signum) {
                // Mimic the child's termination so our own parent
                // observes the true cause.
                mainthread::execute(move || {
                    let _ = signal::raise_signal(sig);
                });
            }
            std::process::exit(final_status.exit_code());
        }
        ContainerStatus::Exited(code) => {
            debug!("child exited with exit status {code}");
            std::process::exit(code);
        }
        ContainerStatus::Running => std::process::exit(0),
    }
}

/// Read the start barrier and drive the optional pre-start hook. Setup
/// failures reported by stage-2 are deferred to the monitor; only
/// master-side hook failures reach the fatal channel.
fn start_synchronizer(
    mut master: UnixStream,
    engine: Arc<Engine>,
    pid: Pid,
    fatal_tx: FatalSender,
) {
    let mut buf = [0u8; 1];

    let n = match master.read(&mut buf) {
        Ok(n) => n,
        Err(err) => {
            let _ = fatal_tx.send(Some(StarterError::Process(format!(
                "error while reading master socket data: {err}"
            ))));
            return;
        }
    };
    if barrier_outcome(n, buf[0]) == BarrierOutcome::Defer {
        debug!("stage 2 reported an error or was interrupted, waiting status");
        return;
    }

    if let Some(hook) = engine.operations.pre_start() {
        if let Err(err) = hook.pre_start_process(pid, &mut master) {
            let _ = fatal_tx.send(Some(StarterError::Engine(format!(
                "pre start process failed: {err}"
            ))));
            return;
        }
    }

    // Second read: stage-2 confirms right before exec. EOF here means
    // it died in between; the monitor owns the status either way.
    let n = match master.read(&mut buf) {
        Ok(n) => n,
        Err(_) => {
            debug!("stage 2 process was interrupted, waiting status");
            return;
        }
    };
    if barrier_outcome(n, buf[0]) == BarrierOutcome::Defer {
        debug!("stage 2 process reported an error, waiting status");
        return;
    }

    if let Err(err) = engine.operations.post_start_process(pid) {
        let _ = fatal_tx.send(Some(StarterError::Engine(format!(
            "post start process failed: {err}"
        ))));
    }
}

/// Shared monitor loop: block on the signal queue, forward deliverable
/// signals to the container, and reap it when SIGCHLD arrives. The
/// periodic wait guards against a SIGCHLD delivered before the queue
/// was installed.
pub fn monitor_child(pid: Pid, signals: &Receiver<Signal>) -> Result<ContainerStatus> {
    loop {
        match signals.recv_timeout(Duration::from_millis(500)) {
            Ok(Signal::SIGCHLD) | Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => {}
                    Ok(WaitStatus::Exited(_, code)) => return Ok(ContainerStatus::Exited(code)),
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        return Ok(ContainerStatus::Signaled(sig as i32))
                    }
                    Ok(_) => {}
                    Err(Errno::EINTR) => {}
                    Err(Errno::ECHILD) => {
                        return Err(StarterError::Process(
                            "container process disappeared".to_string(),
                        ))
                    }
                    Err(err) => {
                        return Err(StarterError::Process(format!(
                            "waitpid({pid}) failed: {err}"
                        )))
                    }
                }
            }
            Ok(sig) => {
                if signal::should_forward(sig) {
                    signal::forward(pid, sig);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(StarterError::Signal(
                    "signal dispatcher terminated".to_string(),
                ))
            }
        }
    }
}
