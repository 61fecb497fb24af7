//! Per-session supervision: dispatch, monitoring, and finish handling.
//!
//! Each live session runs one independent supervisor task. The task waits
//! for the shell to settle, writes the command, then polls the process tree
//! on a fixed cadence, classifying the command's workload and emitting
//! events only when the aggregate status changes. When the workload
//! disappears it either reports the recorded operator interrupt or probes
//! the shell for the exit code of the finished command.
//!
//! A tick that completes after the session has been torn down is a no-op:
//! every mutation and emission is preceded by a registry liveness check.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::SupervisorConfig;
use crate::events::{CommandOutcome, FinishStatus, ProcessDetail, SupervisorEvent};
use crate::interpret::{aggregate_status, interpret, RunState};
use crate::probe::ExitProbe;
use crate::proc_tree::{self, ProcessSnapshot};
use crate::registry::{SessionHandle, SessionRegistry};

pub(crate) struct SessionSupervisor {
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
    event_tx: mpsc::Sender<SupervisorEvent>,
    config: SupervisorConfig,
}

enum Tick {
    Continue,
    Finished,
}

impl SessionSupervisor {
    pub(crate) fn new(
        registry: Arc<SessionRegistry>,
        handle: Arc<SessionHandle>,
        event_tx: mpsc::Sender<SupervisorEvent>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            handle,
            event_tx,
            config,
        }
    }

    /// Dispatches the command and runs the monitor loop until the command
    /// finishes or the session is torn down.
    pub(crate) async fn run(self) {
        // The shell needs a moment to finish its own startup before it
        // accepts input reliably.
        tokio::time::sleep(self.config.settle_delay()).await;
        if !self.alive() {
            return;
        }

        let line = format!("{}\n", self.handle.command);
        if !self.handle.write(line.into_bytes()) {
            warn!(session_id = %self.handle.session_id, "pty writer gone before dispatch");
            return;
        }
        self.handle.with_state(|state| state.command_sent = true);
        debug!(
            session_id = %self.handle.session_id,
            command = %self.handle.command,
            "command dispatched"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.alive() {
                return;
            }
            if let Tick::Finished = self.tick().await {
                return;
            }
        }
    }

    fn alive(&self) -> bool {
        self.registry.get(&self.handle.session_id).is_some()
    }

    async fn tick(&self) -> Tick {
        let rows = match proc_tree::list_descendants(
            self.handle.root_pid,
            self.config.ps_timeout(),
        )
        .await
        {
            Ok(rows) => rows,
            Err(err) => {
                // No information this tick; retry on the next one.
                debug!(session_id = %self.handle.session_id, %err, "process table unavailable");
                return Tick::Continue;
            }
        };
        let workload = filter_workload(rows);

        if workload.is_empty() {
            let should_finish = self.handle.with_state(|state| {
                if state.process_detected && !state.finished {
                    state.finished = true;
                    true
                } else {
                    false
                }
            });
            if should_finish {
                self.finish().await;
                return Tick::Finished;
            }
            return Tick::Continue;
        }

        let first_detection = self.handle.with_state(|state| {
            let first = !state.process_detected;
            state.process_detected = true;
            for process in &workload {
                state.tracked_pids.insert(process.pid);
            }
            first
        });
        if first_detection {
            self.emit(SupervisorEvent::CommandStarted {
                session_id: self.handle.session_id.clone(),
            })
            .await;
        }

        let interpreted: Vec<_> = workload
            .iter()
            .map(|process| interpret(&process.raw_state))
            .collect();
        let states: Vec<RunState> = interpreted.iter().map(|i| i.status).collect();
        let aggregate = aggregate_status(&states);

        let changed = self.handle.with_state(|state| {
            if state.finished {
                return false;
            }
            if state.last_status != Some(aggregate) {
                state.last_status = Some(aggregate);
                true
            } else {
                false
            }
        });
        if changed {
            let processes: Vec<ProcessDetail> = workload
                .iter()
                .zip(interpreted)
                .map(|(process, interpreted)| ProcessDetail {
                    pid: process.pid,
                    command: process.command.clone(),
                    status: interpreted.status,
                    description: interpreted.description,
                    memory_kb: process.memory_kb,
                    cpu_percent: process.cpu_percent,
                })
                .collect();
            let process_count = processes.len();
            self.emit(SupervisorEvent::CommandStatusUpdate {
                session_id: self.handle.session_id.clone(),
                status: aggregate,
                description: aggregate.describe().to_string(),
                processes,
                process_count,
            })
            .await;
        }

        Tick::Continue
    }

    /// The workload is gone. Report the recorded interrupt, or probe the
    /// shell for the command's exit code.
    async fn finish(&self) {
        let (ctrl_c, ctrl_d) = self.handle.with_state(|state| (state.ctrl_c, state.ctrl_d));

        let outcome = if ctrl_c || ctrl_d {
            // The process is already gone; there is nothing to probe.
            CommandOutcome {
                status: FinishStatus::Stopped,
                exit_code: None,
                exit_status: if ctrl_c {
                    "terminated (Ctrl+C)".to_string()
                } else {
                    "terminated by EOF".to_string()
                },
                was_killed: ctrl_c,
                was_eof: ctrl_d,
            }
        } else {
            self.probe_exit_code().await
        };

        if !self.alive() {
            // Torn down while finishing; the exit callback owns the rest.
            return;
        }
        debug!(
            session_id = %self.handle.session_id,
            status = ?outcome.status,
            exit_code = ?outcome.exit_code,
            "command finished"
        );
        self.emit(SupervisorEvent::CommandFinished {
            session_id: self.handle.session_id.clone(),
            outcome,
        })
        .await;
    }

    async fn probe_exit_code(&self) -> CommandOutcome {
        let probe = ExitProbe::new();
        let probe_line = probe.command();
        let captured = self.handle.probe.arm(probe);
        if !self.handle.write(probe_line.into_bytes()) {
            warn!(session_id = %self.handle.session_id, "pty writer gone before exit probe");
            return unrecoverable_outcome();
        }

        match tokio::time::timeout(self.config.probe_timeout(), captured).await {
            Ok(Ok(code)) => {
                self.handle.with_state(|state| state.exit_code = Some(code));
                CommandOutcome {
                    status: if code == 0 {
                        FinishStatus::Done
                    } else {
                        FinishStatus::Error
                    },
                    exit_code: Some(code),
                    exit_status: format!("exited with code {code}"),
                    was_killed: false,
                    was_eof: false,
                }
            }
            _ => {
                warn!(
                    session_id = %self.handle.session_id,
                    "exit probe was never observed, reporting unknown exit code"
                );
                unrecoverable_outcome()
            }
        }
    }

    async fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

fn unrecoverable_outcome() -> CommandOutcome {
    CommandOutcome {
        status: FinishStatus::Error,
        exit_code: None,
        exit_status: "finished, exit code unknown".to_string(),
        was_killed: false,
        was_eof: false,
    }
}

/// Drops the shell's own bookkeeping children so only the caller's real
/// workload is considered: the state probe itself and the `ps`/utility
/// processes used to read it.
pub(crate) fn filter_workload(rows: Vec<ProcessSnapshot>) -> Vec<ProcessSnapshot> {
    rows.into_iter()
        .filter(|process| !is_bookkeeping(process))
        .collect()
}

fn is_bookkeeping(process: &ProcessSnapshot) -> bool {
    if process.program() == "ps" {
        return true;
    }
    process.command.contains("TERMRACK_EXIT_")
}
