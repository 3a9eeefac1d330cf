//! Wait status and start-barrier types.

use serde::{Deserialize, Serialize};

/// Byte stage-2 writes when setup succeeded and the payload is about
/// to run.
pub const BARRIER_CONTINUE: u8 = b'c';
/// Byte stage-2 writes when setup failed.
pub const BARRIER_FATAL: u8 = b'f';

/// Result of container monitoring, the only status surfaced upward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Running,
    /// Normal exit with the given code (0-255).
    Exited(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
}

impl ContainerStatus {
    /// Exit code the master reports for this status. A signaled child
    /// maps to the shell convention of `128 + signum`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ContainerStatus::Running => 0,
            ContainerStatus::Exited(code) => *code,
            ContainerStatus::Signaled(signum) => 128 + signum,
        }
    }
}

/// What one read of the start barrier means to the master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Stage-2 is proceeding.
    Proceed,
    /// Stage-2 died or reported a setup failure; the monitor owns the
    /// final status.
    Defer,
}

/// Interpret one read from the master socket: `n` bytes received into
/// `byte`. EOF before any byte and an explicit fatal byte both defer
/// to the monitor.
pub fn barrier_outcome(n: usize, byte: u8) -> BarrierOutcome {
    if n == 0 || byte == BARRIER_FATAL {
        BarrierOutcome::Defer
    } else {
        BarrierOutcome::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaled_status_maps_to_shell_convention() {
        assert_eq!(ContainerStatus::Signaled(9).exit_code(), 137);
        assert_eq!(ContainerStatus::Signaled(15).exit_code(), 143);
        assert_eq!(ContainerStatus::Exited(3).exit_code(), 3);
        assert_eq!(ContainerStatus::Exited(0).exit_code(), 0);
    }

    #[test]
    fn barrier_reads_classify_correctly() {
        assert_eq!(barrier_outcome(0, 0), BarrierOutcome::Defer);
        assert_eq!(barrier_outcome(1, BARRIER_FATAL), BarrierOutcome::Defer);
        assert_eq!(barrier_outcome(1, BARRIER_CONTINUE), BarrierOutcome::Proceed);
        // Any non-fatal byte proceeds.
        assert_eq!(barrier_outcome(1, b'x'), BarrierOutcome::Proceed);
    }
}
