//! Session registry: the single source of truth for session lifecycle.
//!
//! Maps session ids to their pty handle and per-session bookkeeping. This
//! is the only shared mutable structure in the crate; all mutation is keyed
//! by session id and treated as owned by that session. Entries are removed
//! only by the exit callback, never by a kill request.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use portable_pty::{ChildKiller, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::interpret::CommandStatus;
use crate::probe::ProbeScanner;

/// Mutable per-session command bookkeeping.
#[derive(Debug, Default)]
pub struct CommandState {
    pub command_sent: bool,
    pub process_detected: bool,
    pub finished: bool,
    pub tracked_pids: HashSet<u32>,
    pub exit_code: Option<i32>,
    pub ctrl_c: bool,
    pub ctrl_d: bool,
    pub ctrl_z: bool,
    pub last_status: Option<CommandStatus>,
}

/// One live pseudo-terminal session.
pub struct SessionHandle {
    pub session_id: String,
    /// Pid of the shell running inside the pty.
    pub root_pid: u32,
    /// The shell line dispatched into the session.
    pub command: String,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    state: Mutex<CommandState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    pub probe: ProbeScanner,
    kill_requested: AtomicBool,
    dimensions: Mutex<(u16, u16)>,
}

impl SessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        root_pid: u32,
        command: String,
        master: Box<dyn MasterPty + Send>,
        killer: Box<dyn ChildKiller + Send + Sync>,
        input_tx: mpsc::UnboundedSender<Vec<u8>>,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            session_id,
            root_pid,
            command,
            master: Mutex::new(master),
            killer: Mutex::new(killer),
            input_tx,
            state: Mutex::new(CommandState::default()),
            monitor: Mutex::new(None),
            probe: ProbeScanner::new(),
            kill_requested: AtomicBool::new(false),
            dimensions: Mutex::new((cols, rows)),
        }
    }

    /// Queues raw bytes for the pty writer thread.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        self.input_tx.send(bytes).is_ok()
    }

    /// Forwards a resize to the pty and records the new dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        let master = self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        master
            .resize(PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        drop(master);
        *self
            .dimensions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = (cols, rows);
        Ok(())
    }

    pub fn dimensions(&self) -> (u16, u16) {
        *self
            .dimensions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests forceful termination of the pty process. Confirmation comes
    /// asynchronously through the exit callback.
    pub fn kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        #[cfg(unix)]
        if self.root_pid != 0 {
            // Hit the shell's whole process group first, then the shell.
            unsafe {
                let pid = self.root_pid as i32;
                let _ = libc::kill(-pid, libc::SIGKILL);
                let _ = libc::kill(pid, libc::SIGKILL);
            }
        }
        let mut killer = self
            .killer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = killer.kill() {
            warn!(session_id = %self.session_id, %err, "kill signal failed");
        }
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    /// Runs a closure against the session's command state under its lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut CommandState) -> R) -> R {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn set_monitor(&self, handle: JoinHandle<()>) {
        *self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub fn take_monitor(&self) -> Option<JoinHandle<()>> {
        self.monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("root_pid", &self.root_pid)
            .field("command", &self.command)
            .finish()
    }
}

enum SessionSlot {
    /// Reserved while the pty is being allocated, so two concurrent spawns
    /// of one id cannot both win.
    Starting,
    Running(Arc<SessionHandle>),
}

/// In-memory map from session id to live session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot for a new session. Returns false when the id is
    /// already reserved or running.
    pub fn reserve(&self, session_id: &str) -> bool {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SessionSlot::Starting);
                true
            }
        }
    }

    /// Promotes a reservation to a running session.
    pub fn install(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.insert(handle.session_id.clone(), SessionSlot::Running(handle));
    }

    /// Drops a reservation after a failed spawn so the id can be reused.
    pub fn release_reservation(&self, session_id: &str) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(SessionSlot::Starting) = sessions.get(session_id) {
            sessions.remove(session_id);
        }
    }

    /// Looks up a running session.
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sessions.get(session_id) {
            Some(SessionSlot::Running(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Whether the id is reserved or running.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(session_id)
    }

    /// Removes a session. Called only from the exit callback.
    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sessions.remove(session_id) {
            Some(SessionSlot::Running(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Snapshot of running session ids at this instant.
    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .iter()
            .filter_map(|(id, slot)| match slot {
                SessionSlot::Running(_) => Some(id.clone()),
                SessionSlot::Starting => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
