//! Terminal process supervisor.
//!
//! Launches shell commands inside pseudo-terminals, observes each session's
//! OS process tree to infer a semantic run status, distinguishes operator
//! interrupts from natural termination, recovers exit codes from the
//! interactive shell, and exposes lifecycle control under concurrent
//! multi-session use.
//!
//! The host application constructs a [`TerminalManager`] with an event
//! channel and drives everything through it:
//!
//! ```no_run
//! use termrack::{SpawnSpec, SupervisorConfig, TerminalManager};
//!
//! # async fn demo() {
//! let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(256);
//! let manager = TerminalManager::new(event_tx, SupervisorConfig::default());
//! if manager.is_supported() {
//!     manager
//!         .spawn(SpawnSpec {
//!             session_id: "api".into(),
//!             command: "npm run dev".into(),
//!             cols: 120,
//!             rows: 40,
//!             working_dir: "/srv/api".into(),
//!         })
//!         .await;
//! }
//! while let Some(event) = event_rx.recv().await {
//!     // forward to the UI / transport layer
//!     let _ = event.payload();
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod interpret;
pub mod manager;
pub mod probe;
pub mod proc_tree;
pub mod registry;
mod supervisor;

pub use config::{load_config, SupervisorConfig};
pub use error::{Result, SupervisorError};
pub use events::{CommandOutcome, FinishStatus, ProcessDetail, SupervisorEvent};
pub use interpret::{aggregate_status, interpret, CommandStatus, InterpretedState, RunState};
pub use manager::{KillSummary, SessionInfo, SpawnSpec, TerminalManager};
pub use proc_tree::ProcessSnapshot;
