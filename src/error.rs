//! Error taxonomy for the terminal supervisor.
//!
//! Spawn-time failures are terminal for that attempt and surfaced to the
//! caller as a one-shot output event. Per-tick process-table failures are
//! transient and absorbed by the monitor loop. Write/resize/kill against an
//! unknown session id are deliberately not errors at all; the facade treats
//! them as no-ops.

use thiserror::Error;

/// Errors produced by the supervisor subsystem.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The host has no usable pseudo-terminal facility.
    #[error("pseudo-terminal support is unavailable on this host")]
    SpawnUnavailable,

    /// The OS refused to allocate the pseudo-terminal or start the shell.
    #[error("failed to start terminal session: {0}")]
    SpawnFailed(String),

    /// The process-table query failed or timed out for this tick.
    #[error("process table unavailable: {0}")]
    ProcessListUnavailable(String),

    /// The sentinel probe was never observed in the session's output.
    #[error("exit code could not be recovered from shell output")]
    ExitCodeUnrecoverable,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
