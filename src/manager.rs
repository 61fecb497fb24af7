//! External-facing supervisor operations.
//!
//! `TerminalManager` is the single entry point used by the rest of the
//! application: spawn a session, write input, resize, kill one or all, and
//! query what is running. It owns the session registry and bridges pty I/O
//! to the host's event channel.
//!
//! Per session it starts: a blocking reader thread (pty output → events +
//! probe scanner), a blocking writer thread (input queue → pty), an exit
//! watcher thread (the exit callback: the only place a session is
//! destroyed), and the async supervisor task that drives monitoring.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::events::SupervisorEvent;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::supervisor::SessionSupervisor;

const READ_CHUNK_SIZE: usize = 8 * 1024;

// Control bytes intercepted on the write path to flag operator intent.
const ETX: u8 = 0x03;
const EOT: u8 = 0x04;
const SUB: u8 = 0x1a;

/// Everything needed to start one terminal session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Caller-supplied unique id for the session.
    pub session_id: String,
    /// Opaque shell line to dispatch once the shell has settled.
    pub command: String,
    pub cols: u16,
    pub rows: u16,
    pub working_dir: PathBuf,
}

/// Snapshot of one live session for callers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub pid: u32,
    /// False once a kill was requested and the exit confirmation is pending.
    pub alive: bool,
    pub exit_code: Option<i32>,
    /// The signal a pending kill was delivered with, if any.
    pub signal: Option<i32>,
    pub command: String,
    pub cols: u16,
    pub rows: u16,
}

/// Result of a `kill_all` sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillSummary {
    pub killed: usize,
    pub total: usize,
}

/// Facade over the session registry and per-session supervisors.
pub struct TerminalManager {
    registry: Arc<SessionRegistry>,
    event_tx: mpsc::Sender<SupervisorEvent>,
    config: SupervisorConfig,
    supported: bool,
}

impl TerminalManager {
    /// Creates the manager and probes the pty facility once, so callers can
    /// degrade gracefully instead of crashing later.
    pub fn new(event_tx: mpsc::Sender<SupervisorEvent>, config: SupervisorConfig) -> Self {
        let supported = pty_available();
        if !supported {
            warn!("no usable pseudo-terminal facility on this host");
        }
        Self {
            registry: Arc::new(SessionRegistry::new()),
            event_tx,
            config,
            supported,
        }
    }

    /// Whether the underlying pty facility is available on this host.
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Starts a new session and dispatches the command into it.
    ///
    /// A colliding session id is a no-op that leaves the existing session
    /// untouched. Spawn failures emit a one-shot output event carrying a
    /// human-readable error; no session is created and no monitor starts.
    pub async fn spawn(&self, spec: SpawnSpec) {
        if !self.supported {
            self.emit_spawn_error(&spec.session_id, &SupervisorError::SpawnUnavailable)
                .await;
            return;
        }
        if !self.registry.reserve(&spec.session_id) {
            warn!(session_id = %spec.session_id, "session already active, ignoring spawn");
            return;
        }

        let cols = if spec.cols == 0 {
            self.config.default_cols
        } else {
            spec.cols
        };
        let rows = if spec.rows == 0 {
            self.config.default_rows
        } else {
            spec.rows
        };
        let shell = self.config.shell_program();
        let working_dir = spec.working_dir.clone();
        let spawned =
            task::spawn_blocking(move || open_shell_pty(&shell, &working_dir, cols, rows)).await;
        let spawned = match spawned {
            Ok(Ok(spawned)) => spawned,
            Ok(Err(err)) => {
                self.registry.release_reservation(&spec.session_id);
                self.emit_spawn_error(&spec.session_id, &err).await;
                return;
            }
            Err(err) => {
                self.registry.release_reservation(&spec.session_id);
                self.emit_spawn_error(
                    &spec.session_id,
                    &SupervisorError::SpawnFailed(err.to_string()),
                )
                .await;
                return;
            }
        };

        let root_pid = spawned.child.process_id().unwrap_or(0);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle::new(
            spec.session_id.clone(),
            root_pid,
            spec.command.clone(),
            spawned.master,
            spawned.killer,
            input_tx,
            cols,
            rows,
        ));
        self.registry.install(Arc::clone(&handle));
        info!(
            session_id = %spec.session_id,
            pid = root_pid,
            command = %spec.command,
            "terminal session started"
        );

        spawn_read_loop(spawned.reader, Arc::clone(&handle), self.event_tx.clone());
        spawn_write_loop(spawned.writer, input_rx);
        spawn_exit_watcher(
            Arc::clone(&self.registry),
            Arc::clone(&handle),
            spawned.child,
            self.event_tx.clone(),
        );

        let supervisor = SessionSupervisor::new(
            Arc::clone(&self.registry),
            Arc::clone(&handle),
            self.event_tx.clone(),
            self.config.clone(),
        );
        handle.set_monitor(tokio::spawn(supervisor.run()));
    }

    /// Writes raw input to a session. Known control bytes (ETX/EOT/SUB) are
    /// flagged as operator intent but forwarded unmodified; the flags only
    /// disambiguate the eventual "finished" reason. Unknown session ids are
    /// a no-op.
    pub async fn write(&self, session_id: &str, bytes: &[u8]) {
        let Some(handle) = self.registry.get(session_id) else {
            debug!(session_id, "write to unknown session ignored");
            return;
        };
        handle.with_state(|state| {
            for byte in bytes {
                match *byte {
                    ETX => state.ctrl_c = true,
                    EOT => state.ctrl_d = true,
                    SUB => state.ctrl_z = true,
                    _ => {}
                }
            }
        });
        handle.write(bytes.to_vec());
    }

    /// Resizes a session's pty. Failures are logged and otherwise ignored;
    /// unknown session ids are a no-op.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let Some(handle) = self.registry.get(session_id) else {
            debug!(session_id, "resize of unknown session ignored");
            return;
        };
        if let Err(err) = handle.resize(cols, rows) {
            warn!(session_id, %err, "pty resize failed");
        }
    }

    /// Requests termination of a session. The acknowledgment is emitted
    /// immediately; the session is removed only when the OS confirms the
    /// exit. Idempotent, and safe on ids that already exited.
    pub async fn kill(&self, session_id: &str) {
        let _ = self
            .event_tx
            .send(SupervisorEvent::ProcessTerminating {
                session_id: session_id.to_string(),
            })
            .await;
        match self.registry.get(session_id) {
            Some(handle) => {
                info!(session_id, "killing terminal session");
                handle.kill();
            }
            None => debug!(session_id, "kill on unknown session is a no-op"),
        }
    }

    /// Best-effort kill of every session registered at call time. Does not
    /// wait for exit confirmations.
    pub async fn kill_all(&self) -> KillSummary {
        let ids = self.registry.session_ids();
        let total = ids.len();
        let mut killed = 0;
        for session_id in ids {
            if self.registry.get(&session_id).is_some() {
                self.kill(&session_id).await;
                killed += 1;
            }
        }
        info!(killed, total, "kill_all sweep complete");
        KillSummary { killed, total }
    }

    /// Details for one live session, or `None` once it has exited.
    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        let handle = self.registry.get(session_id)?;
        Some(session_info(&handle))
    }

    /// Snapshot of all live sessions.
    pub fn list_active(&self) -> Vec<SessionInfo> {
        self.registry
            .session_ids()
            .into_iter()
            .filter_map(|id| self.info(&id))
            .collect()
    }

    async fn emit_spawn_error(&self, session_id: &str, err: &SupervisorError) {
        warn!(session_id, %err, "terminal session spawn failed");
        let message = format!("{err}\r\n");
        let _ = self
            .event_tx
            .send(SupervisorEvent::Output {
                session_id: session_id.to_string(),
                chunk: message.into_bytes(),
            })
            .await;
    }
}

fn session_info(handle: &SessionHandle) -> SessionInfo {
    let (cols, rows) = handle.dimensions();
    SessionInfo {
        session_id: handle.session_id.clone(),
        pid: handle.root_pid,
        alive: !handle.kill_requested(),
        exit_code: handle.with_state(|state| state.exit_code),
        signal: exit_signal(handle),
        command: handle.command.clone(),
        cols,
        rows,
    }
}

/// Checks once whether a pty can actually be allocated on this host.
fn pty_available() -> bool {
    native_pty_system()
        .openpty(PtySize {
            rows: 4,
            cols: 4,
            pixel_width: 0,
            pixel_height: 0,
        })
        .is_ok()
}

struct SpawnedShell {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

fn open_shell_pty(shell: &str, working_dir: &Path, cols: u16, rows: u16) -> Result<SpawnedShell> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| SupervisorError::SpawnFailed(err.to_string()))?;

    let mut command = CommandBuilder::new(shell);
    command.cwd(working_dir);
    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|err| SupervisorError::SpawnFailed(err.to_string()))?;
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(err) => {
            terminate_child(child);
            return Err(SupervisorError::SpawnFailed(err.to_string()));
        }
    };
    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(err) => {
            terminate_child(child);
            return Err(SupervisorError::SpawnFailed(err.to_string()));
        }
    };
    let killer = child.clone_killer();

    Ok(SpawnedShell {
        master: pair.master,
        reader,
        writer,
        child,
        killer,
    })
}

fn terminate_child(mut child: Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Forwards pty output to the event channel and the probe scanner.
fn spawn_read_loop(
    mut reader: Box<dyn Read + Send>,
    handle: Arc<SessionHandle>,
    event_tx: mpsc::Sender<SupervisorEvent>,
) {
    std::thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    handle.probe.feed(&buffer[..read]);
                    let event = SupervisorEvent::Output {
                        session_id: handle.session_id.clone(),
                        chunk: buffer[..read].to_vec(),
                    };
                    if event_tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

/// Drains the input queue into the pty.
fn spawn_write_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Some(input) = input_rx.blocking_recv() {
            if input.is_empty() {
                continue;
            }
            if writer.write_all(&input).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });
}

/// The exit callback. Blocks on the pty child; when the OS confirms the
/// exit it removes the session, cancels the monitor, and emits the
/// termination pair. This is the only place a session is destroyed.
fn spawn_exit_watcher(
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
    mut child: Box<dyn Child + Send + Sync>,
    event_tx: mpsc::Sender<SupervisorEvent>,
) {
    let runtime = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        let status = child.wait();

        registry.remove(&handle.session_id);
        if let Some(monitor) = handle.take_monitor() {
            monitor.abort();
            // Wait until the monitor has fully stopped before announcing
            // termination, so a finished report already in flight lands
            // ahead of the termination pair, never after it.
            let _ = runtime.block_on(monitor);
        }

        let code = status.ok().map(|status| status.exit_code() as i32);
        let signal = exit_signal(&handle);
        info!(
            session_id = %handle.session_id,
            ?code,
            ?signal,
            "terminal session exited"
        );
        let _ = event_tx.blocking_send(SupervisorEvent::ProcessTerminated {
            session_id: handle.session_id.clone(),
        });
        let _ = event_tx.blocking_send(SupervisorEvent::ProcessEnded {
            session_id: handle.session_id.clone(),
            code,
            signal,
        });
    });
}

#[cfg(unix)]
fn exit_signal(handle: &SessionHandle) -> Option<i32> {
    handle.kill_requested().then_some(libc::SIGKILL)
}

#[cfg(not(unix))]
fn exit_signal(_handle: &SessionHandle) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_probe_reports_availability() {
        // Any unix host running the suite has a pty facility.
        if cfg!(unix) {
            assert!(pty_available());
        }
    }

    #[tokio::test]
    async fn operations_on_unknown_sessions_are_noops() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let manager = TerminalManager::new(event_tx, SupervisorConfig::default());

        manager.write("ghost", b"hello").await;
        manager.resize("ghost", 100, 30).await;
        assert!(manager.info("ghost").is_none());
        assert!(manager.list_active().is_empty());

        // A kill on an unknown id still acknowledges.
        manager.kill("ghost").await;
        let event = event_rx.recv().await.expect("terminating ack");
        assert_eq!(
            event,
            SupervisorEvent::ProcessTerminating {
                session_id: "ghost".into()
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn info_reflects_pending_kill() {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .expect("openpty");
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", "sleep 5"]);
        let mut child = pair.slave.spawn_command(cmd).expect("spawn shell");
        drop(pair.slave);
        let killer = child.clone_killer();
        let (input_tx, _input_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(
            "pending".to_string(),
            child.process_id().unwrap_or(0),
            "sleep 5".to_string(),
            pair.master,
            killer,
            input_tx,
            80,
            24,
        );

        let before = session_info(&handle);
        assert!(before.alive);
        assert!(before.signal.is_none());

        handle.kill();
        let after = session_info(&handle);
        assert!(!after.alive);
        assert_eq!(after.signal, Some(libc::SIGKILL));

        let _ = child.wait();
    }

    #[tokio::test]
    async fn kill_all_on_empty_registry_reports_zero() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let manager = TerminalManager::new(event_tx, SupervisorConfig::default());
        let summary = manager.kill_all().await;
        assert_eq!(summary, KillSummary { killed: 0, total: 0 });
    }
}
