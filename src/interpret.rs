//! Raw process-state interpretation.
//!
//! Maps the state column of a `ps` row to a normalized status plus a human
//! description, and derives the single aggregate status reported for a
//! command that may have spawned several OS processes. Everything here is
//! pure; the monitor loop supplies the data.

use serde::Serialize;

/// Normalized run state of a single OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Sleeping,
    Waiting,
    Stopped,
    Zombie,
    Dead,
    Idle,
    Paging,
    Unknown,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Waiting => "waiting",
            Self::Stopped => "stopped",
            Self::Zombie => "zombie",
            Self::Dead => "dead",
            Self::Idle => "idle",
            Self::Paging => "paging",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Result of interpreting one raw state code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpretedState {
    pub status: RunState,
    pub description: String,
}

/// Interprets a raw `ps` state code (base letter plus modifier flags).
///
/// Total over all inputs: unrecognized base codes resolve to
/// [`RunState::Unknown`] with the original code embedded in the description
/// instead of failing.
pub fn interpret(raw_state: &str) -> InterpretedState {
    let mut chars = raw_state.chars();
    let Some(base) = chars.next() else {
        return InterpretedState {
            status: RunState::Unknown,
            description: "empty state code".to_string(),
        };
    };

    let (status, base_description) = match base {
        'R' => (RunState::Running, "running or runnable"),
        'S' => (RunState::Sleeping, "interruptible sleep, waiting for an event"),
        'D' | 'U' => (RunState::Waiting, "uninterruptible sleep, usually I/O"),
        'T' | 't' => (RunState::Stopped, "stopped by a job-control or trace signal"),
        'Z' => (RunState::Zombie, "terminated but not reaped by its parent"),
        'X' | 'x' => (RunState::Dead, "dead"),
        'I' => (RunState::Idle, "idle kernel thread"),
        'W' => (RunState::Paging, "paging or swapped out"),
        other => {
            return InterpretedState {
                status: RunState::Unknown,
                description: format!("unrecognized state code '{other}' in '{raw_state}'"),
            };
        }
    };

    let mut description = base_description.to_string();
    for modifier in chars {
        let clause = match modifier {
            '<' => "high priority",
            'N' => "low priority",
            'L' => "pages locked in memory",
            's' => "session leader",
            'l' => "multi-threaded",
            '+' => "in the foreground process group",
            _ => continue,
        };
        description.push_str(", ");
        description.push_str(clause);
    }

    InterpretedState {
        status,
        description,
    }
}

/// Aggregate run state reported for a whole command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Running,
    Sleeping,
    Waiting,
    Finishing,
    Paused,
}

impl CommandStatus {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Running => "command is running",
            Self::Sleeping => "all processes are sleeping, waiting for an event",
            Self::Waiting => "waiting on uninterruptible I/O",
            Self::Finishing => "finishing, a process awaits reaping",
            Self::Paused => "paused by a stop signal",
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Waiting => "waiting",
            Self::Finishing => "finishing",
            Self::Paused => "paused",
        };
        write!(f, "{name}")
    }
}

/// Derives the aggregate status for a set of per-process states.
///
/// Precedence: stopped > zombie > waiting > all-sleeping > running. Any
/// stopped process pauses the whole command; absent that, any zombie means
/// the command is finishing; absent that, any uninterruptible wait wins;
/// when every process is merely sleeping or idle the aggregate is sleeping;
/// anything else counts as running.
pub fn aggregate_status(states: &[RunState]) -> CommandStatus {
    if states.iter().any(|s| *s == RunState::Stopped) {
        return CommandStatus::Paused;
    }
    if states.iter().any(|s| *s == RunState::Zombie) {
        return CommandStatus::Finishing;
    }
    if states.iter().any(|s| *s == RunState::Waiting) {
        return CommandStatus::Waiting;
    }
    if !states.is_empty()
        && states
            .iter()
            .all(|s| matches!(s, RunState::Sleeping | RunState::Idle))
    {
        return CommandStatus::Sleeping;
    }
    CommandStatus::Running
}
