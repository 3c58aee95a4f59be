//! dev_launch
//!
//! Starts a local web dev server and gets a browser pointed at it.
//!
//! # Overview
//!
//! A launch runs through these phases:
//! - Kill whatever still holds the dev server port from a previous run
//! - Optionally start a local backend emulator and wait for its ports
//! - Install dependencies if the dev tool is missing, then spawn the dev server
//! - Echo its output while looking for the URL it announces
//! - Fall back to the port the server's process tree holds, or the configured default
//! - Poll the URL until it answers, then open the browser
//! - On Ctrl+C, stop every started process in reverse order
//!
//! # Example Config
//!
//! ```yaml
//! port: 5173
//! reap_ports: "5173-5175"
//! command:
//!   program: npm
//!   args: [run, dev]
//! timeouts:
//!   url_secs: 30
//! emulator:
//!   project: demo-project
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{ConfigError, LaunchConfig};
pub use runtime::{
    LaunchError, LaunchOptions, ManagedProcess, Orchestrator, OrchestratorState, PortRange,
    PortReaper, ProcessConfig, ProcessError, ProcessGroup, ProcessStatus, ReadinessProber,
    RunOutcome,
};
