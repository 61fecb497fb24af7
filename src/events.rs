//! Event contract between the supervisor and the host application.
//!
//! All lifecycle notifications flow through a single `SupervisorEvent`
//! channel supplied by the host. Events are transport-agnostic and
//! JSON-serializable so an IPC layer can forward them verbatim.

use serde::Serialize;

use crate::interpret::{CommandStatus, RunState};

/// How a dispatched command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    /// Natural exit with code 0.
    Done,
    /// Natural exit with a nonzero (or unrecoverable) code.
    Error,
    /// Ended by an operator interrupt.
    Stopped,
}

/// Final report for a finished command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub status: FinishStatus,
    /// Recovered numeric exit code; `None` when the command was interrupted
    /// or the sentinel probe was never observed.
    pub exit_code: Option<i32>,
    /// Human-readable summary ("exited with code 0", "terminated (Ctrl+C)").
    pub exit_status: String,
    pub was_killed: bool,
    pub was_eof: bool,
}

/// One row of the live process tree included in a status update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessDetail {
    pub pid: u32,
    pub command: String,
    pub status: RunState,
    pub description: String,
    pub memory_kb: u64,
    pub cpu_percent: f32,
}

/// Lifecycle events emitted by the supervisor.
///
/// Per-session ordering: `Output` events are interleaved arbitrarily often;
/// otherwise a session emits `CommandStarted`, zero or more
/// `CommandStatusUpdate`s (only on aggregate changes), at most one
/// `CommandFinished`, then `ProcessTerminated` + `ProcessEnded` once the
/// pty process actually exits. `ProcessTerminating` acknowledges a kill
/// request immediately.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// Raw pty output, forwarded verbatim.
    Output {
        session_id: String,
        chunk: Vec<u8>,
    },
    /// The dispatched command's own processes were first observed.
    CommandStarted { session_id: String },
    /// The aggregate status changed since the last report.
    CommandStatusUpdate {
        session_id: String,
        status: CommandStatus,
        description: String,
        processes: Vec<ProcessDetail>,
        process_count: usize,
    },
    /// The command's processes are gone; final verdict attached.
    CommandFinished {
        session_id: String,
        outcome: CommandOutcome,
    },
    /// A kill was requested; termination is confirmed separately.
    ProcessTerminating { session_id: String },
    /// The pty process exited; the session no longer exists.
    ProcessTerminated { session_id: String },
    /// Exit details for the transport layer, paired with `ProcessTerminated`.
    ProcessEnded {
        session_id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl SupervisorEvent {
    /// The session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::Output { session_id, .. }
            | Self::CommandStarted { session_id }
            | Self::CommandStatusUpdate { session_id, .. }
            | Self::CommandFinished { session_id, .. }
            | Self::ProcessTerminating { session_id }
            | Self::ProcessTerminated { session_id }
            | Self::ProcessEnded { session_id, .. } => session_id,
        }
    }

    /// Renders the event as a JSON payload for the transport layer.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
