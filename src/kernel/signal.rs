//! Master signal plumbing.
//!
//! The master must observe every deliverable signal from the moment
//! stage-1 exists, queue them until the monitor is ready, and forward
//! them to the container. The handler itself only writes the signal
//! number to a pipe; a dispatcher thread drains the pipe into a bounded
//! channel the monitor reads from.

use crate::config::types::{Result, StarterError};
use crossbeam_channel::{bounded, Receiver};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe2, read, Pid};
use std::sync::atomic::{AtomicI32, Ordering};

/// Queue capacity. Two slots tolerate a queued signal alongside the
/// runtime preemption signal.
const QUEUE_CAPACITY: usize = 2;

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn enqueue_signal(signum: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // Safety: write(2) is async-signal-safe; nothing else happens here.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Signals we never install a handler for: the kernel refuses the
/// first two, and a queued handler cannot meaningfully resume from a
/// synchronous fault.
fn uncatchable(sig: Signal) -> bool {
    matches!(
        sig,
        Signal::SIGKILL
            | Signal::SIGSTOP
            | Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGFPE
            | Signal::SIGILL
    )
}

/// Install the catch-all handler and start the dispatcher thread.
/// Every deliverable signal except `SIGURG` ends up in the returned
/// channel; when the queue is full, excess signals are dropped.
pub fn install_queue() -> Result<Receiver<Signal>> {
    let (pipe_read, pipe_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| StarterError::Signal(format!("pipe failed: {e}")))?;
    PIPE_WRITE_FD.store(pipe_write, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(enqueue_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in Signal::iterator() {
        if uncatchable(sig) {
            continue;
        }
        // Safety: the handler only performs an async-signal-safe write.
        unsafe {
            sigaction(sig, &action)
                .map_err(|e| StarterError::Signal(format!("sigaction for {sig} failed: {e}")))?;
        }
    }

    let (tx, rx) = bounded(QUEUE_CAPACITY);
    std::thread::spawn(move || loop {
        let mut byte = [0u8; 1];
        match read(pipe_read, &mut byte) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let Ok(sig) = Signal::try_from(byte[0] as i32) else {
                    continue;
                };
                if sig == Signal::SIGURG {
                    // Reserved for runtime preemption, never queued.
                    continue;
                }
                if tx.try_send(sig).is_err() {
                    debug!("signal queue full, dropping {sig}");
                }
            }
        }
    });

    Ok(rx)
}

/// Restore the default disposition of every signal the queue handled.
pub fn reset_handlers() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in Signal::iterator() {
        if uncatchable(sig) {
            continue;
        }
        // Safety: restoring the default handler.
        unsafe {
            let _ = sigaction(sig, &action);
        }
    }
}

/// Whether a queued signal should be forwarded to the container.
/// Signals whose default action is to be ignored are skipped, as is
/// `SIGCHLD` (consumed by the monitor itself).
pub fn should_forward(sig: Signal) -> bool {
    !matches!(sig, Signal::SIGCHLD | Signal::SIGURG | Signal::SIGWINCH)
}

/// Forward a signal to the container process.
pub fn forward(pid: Pid, sig: Signal) {
    match kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!("forwarding {sig} to {pid} failed: {e}"),
    }
}

/// Re-raise a signal on the current process, used by the master to
/// mimic the container's termination cause for its own parent.
pub fn raise_signal(sig: Signal) -> Result<()> {
    nix::sys::signal::raise(sig)
        .map_err(|e| StarterError::Signal(format!("raise {sig} failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn forwarding_skips_ignored_defaults() {
        assert!(!should_forward(Signal::SIGCHLD));
        assert!(!should_forward(Signal::SIGURG));
        assert!(!should_forward(Signal::SIGWINCH));
        assert!(should_forward(Signal::SIGTERM));
        assert!(should_forward(Signal::SIGINT));
    }

    #[test]
    fn queued_signal_reaches_the_channel() {
        let rx = install_queue().unwrap();
        raise_signal(Signal::SIGUSR1).unwrap();
        let sig = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sig, Signal::SIGUSR1);
        reset_handlers();
    }
}
