//! End-to-end supervisor scenarios against real shells.

#![cfg(unix)]

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use termrack::{
    FinishStatus, KillSummary, SpawnSpec, SupervisorConfig, SupervisorEvent, TerminalManager,
};

const EVENT_DEADLINE: Duration = Duration::from_secs(20);

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        shell: Some("/bin/sh".to_string()),
        poll_interval_ms: 200,
        settle_delay_ms: 200,
        probe_timeout_ms: 8000,
        ps_timeout_ms: 3000,
        ..SupervisorConfig::default()
    }
}

fn spec(session_id: &str, command: &str) -> SpawnSpec {
    SpawnSpec {
        session_id: session_id.to_string(),
        command: command.to_string(),
        cols: 80,
        rows: 24,
        working_dir: std::env::temp_dir(),
    }
}

/// Collects every event while waiting for specific ones, so tests can make
/// whole-run assertions afterwards.
struct EventLog {
    rx: mpsc::Receiver<SupervisorEvent>,
    seen: Vec<SupervisorEvent>,
}

impl EventLog {
    fn new(rx: mpsc::Receiver<SupervisorEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Returns the first matching event, including ones already collected
    /// while waiting for something else (events of independent sessions
    /// interleave arbitrarily).
    async fn wait_for(
        &mut self,
        predicate: impl Fn(&SupervisorEvent) -> bool,
    ) -> SupervisorEvent {
        if let Some(event) = self.seen.iter().find(|event| predicate(event)) {
            return event.clone();
        }
        timeout(EVENT_DEADLINE, async {
            loop {
                let event = self.rx.recv().await.expect("event channel closed");
                self.seen.push(event.clone());
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn count(&self, predicate: impl Fn(&SupervisorEvent) -> bool) -> usize {
        self.seen.iter().filter(|event| predicate(event)).count()
    }

    /// Statuses of all status-update events for one session, in order.
    fn status_sequence(&self, session_id: &str) -> Vec<termrack::CommandStatus> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                SupervisorEvent::CommandStatusUpdate {
                    session_id: id,
                    status,
                    ..
                } if id == session_id => Some(*status),
                _ => None,
            })
            .collect()
    }
}

fn is_started(event: &SupervisorEvent, session_id: &str) -> bool {
    matches!(event, SupervisorEvent::CommandStarted { session_id: id } if id == session_id)
}

fn is_finished(event: &SupervisorEvent, session_id: &str) -> bool {
    matches!(event, SupervisorEvent::CommandFinished { session_id: id, .. } if id == session_id)
}

fn is_terminated(event: &SupervisorEvent, session_id: &str) -> bool {
    matches!(event, SupervisorEvent::ProcessTerminated { session_id: id } if id == session_id)
}

#[tokio::test]
async fn short_command_reports_done_then_terminates() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let manager = TerminalManager::new(event_tx, fast_config());
    assert!(manager.is_supported());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("t1", "sleep 2")).await;
    log.wait_for(|e| is_started(e, "t1")).await;

    let finished = log.wait_for(|e| is_finished(e, "t1")).await;
    let SupervisorEvent::CommandFinished { outcome, .. } = finished else {
        unreachable!();
    };
    assert_eq!(outcome.status, FinishStatus::Done);
    assert_eq!(outcome.exit_code, Some(0));
    assert!(!outcome.was_killed);
    assert!(!outcome.was_eof);

    // The shell is still alive after the command; the session only dies on
    // an explicit kill, confirmed by the exit callback.
    assert!(manager.info("t1").is_some());
    manager.kill("t1").await;
    log.wait_for(|e| is_terminated(e, "t1")).await;
    log.wait_for(|e| matches!(e, SupervisorEvent::ProcessEnded { session_id, .. } if session_id == "t1"))
        .await;
    assert!(manager.info("t1").is_none());

    assert_eq!(log.count(|e| is_finished(e, "t1")), 1);
    assert_eq!(log.count(|e| is_terminated(e, "t1")), 1);
    assert_eq!(log.count(|e| is_started(e, "t1")), 1);

    // The finished report must precede the termination pair.
    let finished_at = log
        .seen
        .iter()
        .position(|e| is_finished(e, "t1"))
        .expect("finished recorded");
    let terminated_at = log
        .seen
        .iter()
        .position(|e| is_terminated(e, "t1"))
        .expect("terminated recorded");
    assert!(finished_at < terminated_at);

    // Change-only emission: no two consecutive status updates may repeat.
    let statuses = log.status_sequence("t1");
    for pair in statuses.windows(2) {
        assert_ne!(pair[0], pair[1], "duplicate consecutive status update");
    }
}

#[tokio::test]
async fn nonzero_exit_reports_error_with_code() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("t-err", "sh -c 'sleep 1; exit 3'")).await;
    let finished = log.wait_for(|e| is_finished(e, "t-err")).await;
    let SupervisorEvent::CommandFinished { outcome, .. } = finished else {
        unreachable!();
    };
    assert_eq!(outcome.status, FinishStatus::Error);
    assert_eq!(outcome.exit_code, Some(3));

    manager.kill("t-err").await;
    log.wait_for(|e| is_terminated(e, "t-err")).await;
}

#[tokio::test]
async fn interrupt_reports_stopped_without_exit_code() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("t2", "sleep 30")).await;
    log.wait_for(|e| is_started(e, "t2")).await;

    // ETX through the write path: flagged as operator intent, forwarded to
    // the pty, where the line discipline interrupts the foreground job.
    manager.write("t2", b"\x03").await;

    let finished = log.wait_for(|e| is_finished(e, "t2")).await;
    let SupervisorEvent::CommandFinished { outcome, .. } = finished else {
        unreachable!();
    };
    assert_eq!(outcome.status, FinishStatus::Stopped);
    assert!(outcome.was_killed);
    assert!(outcome.exit_code.is_none());

    manager.kill("t2").await;
    log.wait_for(|e| is_terminated(e, "t2")).await;
}

#[tokio::test]
async fn unobserved_exit_probe_reports_unknown_code() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let mut config = fast_config();
    // Far too short for the sentinel to round-trip through the pty.
    config.probe_timeout_ms = 1;
    let manager = TerminalManager::new(event_tx, config);
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("t-lost", "sleep 1")).await;
    let finished = log.wait_for(|e| is_finished(e, "t-lost")).await;
    let SupervisorEvent::CommandFinished { outcome, .. } = finished else {
        unreachable!();
    };
    assert_eq!(outcome.status, FinishStatus::Error);
    assert!(outcome.exit_code.is_none());
    assert_eq!(outcome.exit_status, "finished, exit code unknown");
    assert!(!outcome.was_killed);
    assert!(!outcome.was_eof);

    manager.kill("t-lost").await;
    log.wait_for(|e| is_terminated(e, "t-lost")).await;
}

#[tokio::test]
async fn process_table_outage_keeps_session_alive() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let mut config = fast_config();
    // Starves every process-table query; each tick retries instead of
    // failing the session.
    config.ps_timeout_ms = 1;
    let manager = TerminalManager::new(event_tx, config);
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("t-blind", "sleep 30")).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let info = manager.info("t-blind").expect("session survives the outage");
    assert!(info.alive);

    manager.kill("t-blind").await;
    log.wait_for(|e| is_terminated(e, "t-blind")).await;
    assert!(manager.info("t-blind").is_none());
}

#[tokio::test]
async fn duplicate_spawn_leaves_original_session_untouched() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("dup", "sleep 10")).await;
    log.wait_for(|e| is_started(e, "dup")).await;
    let original = manager.info("dup").expect("session active");

    manager.spawn(spec("dup", "echo other")).await;
    let after = manager.info("dup").expect("session still active");
    assert_eq!(after.pid, original.pid);
    assert_eq!(after.command, "sleep 10");
    assert_eq!(manager.list_active().len(), 1);

    manager.kill("dup").await;
    log.wait_for(|e| is_terminated(e, "dup")).await;
}

#[tokio::test]
async fn concurrent_sessions_do_not_crosstalk() {
    let (event_tx, event_rx) = mpsc::channel(2048);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("a", "sleep 2")).await;
    manager.spawn(spec("b", "sleep 3")).await;

    let finished_a = log.wait_for(|e| is_finished(e, "a")).await;
    let finished_b = log.wait_for(|e| is_finished(e, "b")).await;
    for finished in [finished_a, finished_b] {
        let SupervisorEvent::CommandFinished { outcome, .. } = finished else {
            unreachable!();
        };
        assert_eq!(outcome.status, FinishStatus::Done);
        assert_eq!(outcome.exit_code, Some(0));
    }

    manager.kill("a").await;
    manager.kill("b").await;
    log.wait_for(|e| is_terminated(e, "a")).await;
    log.wait_for(|e| is_terminated(e, "b")).await;

    for id in ["a", "b"] {
        assert_eq!(log.count(|e| is_started(e, id)), 1, "session {id}");
        assert_eq!(log.count(|e| is_finished(e, id)), 1, "session {id}");
        assert_eq!(log.count(|e| is_terminated(e, id)), 1, "session {id}");
    }
    for event in &log.seen {
        assert!(matches!(event.session_id(), "a" | "b"));
    }
}

#[tokio::test]
async fn kill_all_sweeps_every_session() {
    let (event_tx, event_rx) = mpsc::channel(2048);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    for id in ["s1", "s2", "s3"] {
        manager.spawn(spec(id, "sleep 30")).await;
    }
    assert_eq!(manager.list_active().len(), 3);

    let summary = manager.kill_all().await;
    assert_eq!(summary, KillSummary { killed: 3, total: 3 });

    for id in ["s1", "s2", "s3"] {
        log.wait_for(|e| is_terminated(e, id)).await;
    }
    assert!(manager.list_active().is_empty());
    for id in ["s1", "s2", "s3"] {
        assert_eq!(log.count(|e| is_terminated(e, id)), 1);
    }
}

#[tokio::test]
async fn kill_is_idempotent_and_safe_after_exit() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("once", "sleep 30")).await;
    log.wait_for(|e| is_started(e, "once")).await;

    manager.kill("once").await;
    manager.kill("once").await;
    log.wait_for(|e| is_terminated(e, "once")).await;

    // Racing a kill against a session that already exited stays a no-op.
    manager.kill("once").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(event) = log.rx.try_recv() {
        log.seen.push(event);
    }

    assert_eq!(log.count(|e| is_terminated(e, "once")), 1);
    assert_eq!(log.count(|e| is_finished(e, "once")), 0);
}

#[tokio::test]
async fn kill_before_detection_terminates_with_signal() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("early", "sleep 30")).await;
    manager.kill("early").await;

    log.wait_for(|e| {
        matches!(e, SupervisorEvent::ProcessTerminating { session_id } if session_id == "early")
    })
    .await;
    log.wait_for(|e| is_terminated(e, "early")).await;
    let ended = log
        .wait_for(|e| matches!(e, SupervisorEvent::ProcessEnded { session_id, .. } if session_id == "early"))
        .await;
    let SupervisorEvent::ProcessEnded { signal, .. } = ended else {
        unreachable!();
    };
    assert!(signal.is_some());
    assert_eq!(log.count(|e| is_finished(e, "early")), 0);
}

#[tokio::test]
async fn output_is_forwarded_verbatim() {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let manager = TerminalManager::new(event_tx, fast_config());
    let mut log = EventLog::new(event_rx);

    manager.spawn(spec("echoing", "echo rack-marker-xyz; sleep 2")).await;
    log.wait_for(|e| {
        matches!(
            e,
            SupervisorEvent::Output { session_id, chunk }
                if session_id == "echoing"
                    && String::from_utf8_lossy(chunk).contains("rack-marker-xyz")
        )
    })
    .await;

    manager.kill("echoing").await;
    log.wait_for(|e| is_terminated(e, "echoing")).await;
}
