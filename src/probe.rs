//! Exit-code recovery via a sentinel probe.
//!
//! An interactive shell does not report the exit status of the commands it
//! runs, so after a command's processes disappear the supervisor injects an
//! `echo` of `$?` tagged with a unique marker and scrapes the marker back
//! out of subsequent pty output. The technique is inherently fragile, so it
//! lives behind this narrow interface; the rest of the state machine only
//! sees an armed scanner and a oneshot with the recovered code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use regex::Regex;
use strip_ansi_escapes::strip;
use tokio::sync::oneshot;

// Tail bytes retained between chunks so a marker split across reads still
// matches.
const TAIL_LIMIT: usize = 4096;

static PROBE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One sentinel probe: a unique marker and its capture pattern.
#[derive(Debug)]
pub struct ExitProbe {
    marker: String,
    pattern: Option<Regex>,
}

impl ExitProbe {
    pub fn new() -> Self {
        let serial = PROBE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let marker = format!("TERMRACK_EXIT_{}_{}", std::process::id(), serial);
        // Digits are required after the marker, so the echoed-back command
        // line (which still shows the literal `$?`) never matches.
        let pattern = Regex::new(&format!("{}:([0-9]+)", marker)).ok();
        Self { marker, pattern }
    }

    /// The shell line that makes the session echo its last exit status.
    pub fn command(&self) -> String {
        format!("echo \"{}:$?\"\n", self.marker)
    }

    /// Extracts the exit code from accumulated output, if present.
    pub fn capture(&self, text: &str) -> Option<i32> {
        let pattern = self.pattern.as_ref()?;
        pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|code| code.as_str().parse::<i32>().ok())
    }
}

impl Default for ExitProbe {
    fn default() -> Self {
        Self::new()
    }
}

struct ScannerInner {
    tail: String,
    armed: Option<(ExitProbe, oneshot::Sender<i32>)>,
}

/// Scans pty output for an armed probe's marker.
///
/// Shared between the blocking pty reader thread (`feed`) and the session
/// supervisor task (`arm`).
pub struct ProbeScanner {
    inner: Mutex<ScannerInner>,
}

impl ProbeScanner {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ScannerInner {
                tail: String::new(),
                armed: None,
            }),
        }
    }

    /// Arms the scanner with a probe; the receiver resolves once the marker
    /// is observed. Re-arming replaces any previous probe.
    pub fn arm(&self, probe: ExitProbe) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.tail.clear();
            inner.armed = Some((probe, tx));
        }
        rx
    }

    /// Feeds a raw output chunk to the scanner. ANSI escapes are stripped
    /// before matching; a no-op while no probe is armed.
    pub fn feed(&self, chunk: &[u8]) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.armed.is_none() {
            return;
        }

        let clean = strip(chunk);
        inner.tail.push_str(&String::from_utf8_lossy(&clean));
        if inner.tail.len() > TAIL_LIMIT {
            let cut = inner.tail.len() - TAIL_LIMIT;
            // Cut on a char boundary.
            let cut = (cut..inner.tail.len())
                .find(|i| inner.tail.is_char_boundary(*i))
                .unwrap_or(0);
            inner.tail.drain(..cut);
        }

        let code = match &inner.armed {
            Some((probe, _)) => probe.capture(&inner.tail),
            None => None,
        };
        if let Some(code) = code {
            if let Some((_, tx)) = inner.armed.take() {
                let _ = tx.send(code);
            }
            inner.tail.clear();
        }
    }
}

impl Default for ProbeScanner {
    fn default() -> Self {
        Self::new()
    }
}
