//! Main-thread dispatch.
//!
//! `execve` and signal re-raise must run on the OS thread that owns the
//! process identity. The master parks its main thread in a dispatch
//! loop and worker threads marshal those operations to it.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::OnceLock;

type Job = Box<dyn FnOnce() + Send>;

static DISPATCHER: OnceLock<Sender<Job>> = OnceLock::new();

/// Handle owned by the main thread after `init`.
pub struct MainThread {
    jobs: Receiver<Job>,
}

/// Install the dispatcher. Must be called from the main thread before
/// any worker that intends to use `execute` is spawned.
pub fn init() -> MainThread {
    let (tx, rx) = unbounded();
    let _ = DISPATCHER.set(tx);
    MainThread { jobs: rx }
}

impl MainThread {
    /// Run queued jobs until the process exits. Jobs that terminate the
    /// process never return, which ends the loop with it.
    pub fn park(self) {
        for job in self.jobs.iter() {
            job();
        }
    }
}

/// Run `f` on the main thread and wait for it to finish. Falls back to
/// running inline when no dispatcher was installed.
pub fn execute<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match DISPATCHER.get() {
        Some(tx) => {
            let (done_tx, done_rx) = bounded::<()>(0);
            let job: Job = Box::new(move || {
                f();
                let _ = done_tx.send(());
            });
            if tx.send(job).is_ok() {
                // A job that exits the process never signals completion.
                let _ = done_rx.recv();
            }
        }
        None => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn execute_marshals_to_the_parked_thread() {
        let main = init();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let worker = std::thread::spawn(move || {
            execute(move || flag.store(true, Ordering::SeqCst));
        });

        // Drain exactly one job, standing in for the parked main thread.
        let job = main.jobs.recv().unwrap();
        job();
        worker.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
