//! Supervisor configuration.
//!
//! Hosts can tune the supervisor from a TOML file; every field has a
//! default so an empty document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Tunables for the terminal supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Shell to launch inside the pty. Defaults to `$SHELL` (unix) or
    /// `powershell.exe` (windows) when unset.
    pub shell: Option<String>,
    /// Monitor tick cadence in milliseconds. This is the lower bound on
    /// status-change detection latency.
    pub poll_interval_ms: u64,
    /// Grace period between spawning the shell and writing the command,
    /// letting the shell finish its own startup.
    pub settle_delay_ms: u64,
    /// How long to wait for the exit-code sentinel before reporting an
    /// unknown exit code.
    pub probe_timeout_ms: u64,
    /// Time bound on each process-table query.
    pub ps_timeout_ms: u64,
    /// Terminal width used when the caller passes zero columns.
    pub default_cols: u16,
    /// Terminal height used when the caller passes zero rows.
    pub default_rows: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shell: None,
            poll_interval_ms: 1000,
            settle_delay_ms: 1000,
            probe_timeout_ms: 5000,
            ps_timeout_ms: 800,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn ps_timeout(&self) -> Duration {
        Duration::from_millis(self.ps_timeout_ms.max(1))
    }

    /// Resolves the shell program to run inside the pty.
    pub fn shell_program(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        default_shell()
    }
}

#[cfg(unix)]
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(windows)]
fn default_shell() -> String {
    "powershell.exe".to_string()
}

/// Loads and parses the supervisor configuration from a file path.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: SupervisorConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
