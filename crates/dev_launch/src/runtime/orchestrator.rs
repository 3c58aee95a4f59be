//! Orchestrator - frees the port, starts the dev server, finds its URL and opens a browser
//!
//! Only a missing executable or a failed dependency install is fatal. Everything else
//! (reaping, emulator startup, URL detection, readiness) degrades with a warning, since
//! the goal is to get a browser pointed at something quickly.

use crate::config::{ensure_sidecar_files, ConfigError, LaunchConfig};
use crate::runtime::browser::{BrowserLauncher, SystemBrowser};
use crate::runtime::probe::{wait_for_ports, ReadinessProber};
use crate::runtime::process::{OutputMode, ProcessConfig, ProcessError, ProcessGroup};
use crate::runtime::reaper::{
    process_tree, PortReaper, ProcessKiller, SignalKiller, SocketTable, SystemSocketTable,
};
use crate::runtime::watcher::{DetectedUrls, LogWatcher};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Name of the primary dev server process
pub const PRIMARY: &str = "dev-server";

/// Name of the sidecar emulator process
pub const EMULATOR: &str = "emulator";

/// Time given to the OS to release ports after killing their owners
const PORT_RELEASE_DELAY: Duration = Duration::from_millis(500);

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    ReapingPorts,
    EmulatorStarting,
    EmulatorReady,
    Spawning,
    AwaitingUrl,
    Verifying,
    Ready,
    Degraded,
    ShuttingDown,
    Exited,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::ReapingPorts => "reaping-ports",
            OrchestratorState::EmulatorStarting => "emulator-starting",
            OrchestratorState::EmulatorReady => "emulator-ready",
            OrchestratorState::Spawning => "spawning",
            OrchestratorState::AwaitingUrl => "awaiting-url",
            OrchestratorState::Verifying => "verifying",
            OrchestratorState::Ready => "ready",
            OrchestratorState::Degraded => "degraded",
            OrchestratorState::ShuttingDown => "shutting-down",
            OrchestratorState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// Per-run switches chosen by the operator
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// Start the sidecar emulator first and flag the dev server to use it
    pub emulator: bool,
}

/// Where the URL handed to the browser came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlSource {
    /// Announced with an explicit port in the server's output
    Announced,
    /// Lowest port held by the server's process tree
    SocketTable,
    /// Announced without a port
    ImplicitCandidate,
    /// Statically configured host and port
    Default,
}

/// Result of a completed run
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Process exit code for the launcher
    pub exit_code: i32,
    /// URL the browser was pointed at
    pub url: Option<String>,
    pub url_source: Option<UrlSource>,
    /// Whether readiness was confirmed
    pub ready: bool,
    /// Whether the emulator was started and its ports answered
    pub emulator_ready: bool,
    /// Ended by a shutdown signal
    pub interrupted: bool,
    /// Processes stopped during shutdown, in stop order
    pub stopped: Vec<String>,
}

impl RunOutcome {
    fn interrupted(mut self) -> Self {
        log::info!("Shutdown requested");
        self.interrupted = true;
        self.exit_code = 0;
        self
    }
}

/// Sequences the launcher phases
pub struct Orchestrator {
    config: LaunchConfig,
    options: LaunchOptions,
    reaper: PortReaper,
    socket_table: Arc<dyn SocketTable>,
    browser: Arc<dyn BrowserLauncher>,
    prober: ReadinessProber,
    processes: ProcessGroup,
    watcher: Option<JoinHandle<()>>,
    state: watch::Sender<OrchestratorState>,
}

impl Orchestrator {
    /// Orchestrator backed by the real socket table, signals and browser
    pub fn new(config: LaunchConfig, options: LaunchOptions) -> Result<Self, LaunchError> {
        Self::with_components(
            config,
            options,
            Arc::new(SystemSocketTable),
            Arc::new(SignalKiller),
            Arc::new(SystemBrowser),
        )
    }

    pub fn with_components(
        config: LaunchConfig,
        options: LaunchOptions,
        socket_table: Arc<dyn SocketTable>,
        killer: Arc<dyn ProcessKiller>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, LaunchError> {
        config.validate()?;
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Ok(Self {
            reaper: PortReaper::new(socket_table.clone(), killer),
            processes: ProcessGroup::new(config.timeouts.shutdown()),
            prober: ReadinessProber::new()?,
            config,
            options,
            socket_table,
            browser,
            watcher: None,
            state,
        })
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    fn set_state(&self, state: OrchestratorState, message: impl fmt::Display) {
        self.state.send_replace(state);
        log::info!("[{}] {}", state, message);
    }

    /// Run until the dev server exits or `shutdown` fires, then stop every process
    pub async fn run(&mut self, mut shutdown: watch::Receiver<()>) -> Result<RunOutcome, LaunchError> {
        let result = self.run_phases(&mut shutdown).await;

        self.set_state(OrchestratorState::ShuttingDown, "Stopping managed processes...");
        let stopped = self.processes.shutdown().await;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.set_state(OrchestratorState::Exited, "Done");

        let mut outcome = result?;
        outcome.stopped = stopped;
        Ok(outcome)
    }

    async fn run_phases(
        &mut self,
        shutdown: &mut watch::Receiver<()>,
    ) -> Result<RunOutcome, LaunchError> {
        let mut outcome = RunOutcome::default();
        let timeouts = self.config.timeouts.clone();

        let range = self.config.reap_range();
        self.set_state(
            OrchestratorState::ReapingPorts,
            format!("Freeing port {}", range),
        );
        let reaper = self.reaper.clone();
        match until_shutdown(shutdown, tokio::task::spawn_blocking(move || reaper.reap(range))).await
        {
            None => return Ok(outcome.interrupted()),
            Some(Ok(report)) if !report.killed.is_empty() => {
                tokio::time::sleep(PORT_RELEASE_DELAY).await;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => log::warn!("Port reaping aborted: {}", e),
        }

        if self.options.emulator {
            match until_shutdown(shutdown, self.start_emulator()).await {
                None => return Ok(outcome.interrupted()),
                Some(ready) => outcome.emulator_ready = ready,
            }
        }

        self.set_state(OrchestratorState::Spawning, "Starting dev server");
        match until_shutdown(shutdown, self.ensure_dependencies()).await {
            None => return Ok(outcome.interrupted()),
            Some(result) => result?,
        }
        let (pid, output) = self.spawn_primary()?;

        let detected = DetectedUrls::new();
        self.watcher = Some(LogWatcher::new(detected.clone(), std::io::stdout()).spawn(output));
        self.set_state(
            OrchestratorState::AwaitingUrl,
            format!(
                "Waiting up to {}s for the dev server to announce a URL...",
                timeouts.url_secs
            ),
        );
        let Some(announced) = until_shutdown(shutdown, detected.wait(timeouts.url())).await else {
            return Ok(outcome.interrupted());
        };

        let (url, source, budget) = match announced {
            Some(url) => (url, UrlSource::Announced, timeouts.verify()),
            None => {
                let (url, source) = self.fallback_url(pid, &detected).await;
                (url, source, timeouts.fallback_verify())
            }
        };

        self.set_state(
            OrchestratorState::Verifying,
            format!("Checking {} (from {:?}) responds...", url, source),
        );
        let Some(ready) =
            until_shutdown(shutdown, self.prober.wait_for_server(&url, budget)).await
        else {
            return Ok(outcome.interrupted());
        };

        if ready {
            self.set_state(
                OrchestratorState::Ready,
                format!("Server is up at {} - opening browser...", url),
            );
        } else {
            self.set_state(
                OrchestratorState::Degraded,
                format!(
                    "{} did not respond within {}s, attempting direct connection for diagnostics...",
                    url,
                    budget.as_secs()
                ),
            );
            match self.prober.diagnose(&url).await {
                Ok(status) => log::warn!("Server responded with status {}", status),
                Err(e) => log::warn!("Diagnostic request failed: {}", e),
            }
            log::warn!("Opening browser anyway (may still work in a moment). See logs above.");
        }
        self.open_browser(&url);

        let mut outcome = RunOutcome {
            url: Some(url),
            url_source: Some(source),
            ready,
            ..outcome
        };

        let processes = &mut self.processes;
        let waited = until_shutdown(shutdown, async {
            match processes.get_mut(PRIMARY) {
                Some(process) => process.wait().await,
                None => Ok(None),
            }
        })
        .await;

        match waited {
            None => return Ok(outcome.interrupted()),
            Some(Ok(code)) => outcome.exit_code = code.unwrap_or(1),
            Some(Err(e)) => {
                log::error!("{}", e);
                outcome.exit_code = 1;
            }
        }
        Ok(outcome)
    }

    /// Start the emulator and wait for its ports; every failure here is a warning
    async fn start_emulator(&mut self) -> bool {
        let emulator = self.config.emulator.clone();
        let root = self.config.project_root.clone();
        self.set_state(
            OrchestratorState::EmulatorStarting,
            format!("Starting {} emulator", emulator.service),
        );

        if let Err(e) = ensure_sidecar_files(&root, &emulator) {
            log::warn!("Could not write emulator config files: {}", e);
        }

        let program = match resolve_program(&emulator.program, &root) {
            Ok(program) => program,
            Err(e) => {
                log::warn!("{}. Continuing without the emulator.", e);
                return false;
            }
        };

        let config = ProcessConfig::new(EMULATOR, program)
            .args(emulator.args())
            .working_dir(&root);
        if let Err(e) = self.processes.spawn(config) {
            log::warn!("{}. Continuing without the emulator.", e);
            return false;
        }

        let ports = emulator.ports();
        log::info!(
            "Waiting up to {}s for emulator ports {} and {}...",
            self.config.timeouts.emulator_secs,
            ports[0],
            ports[1]
        );
        let ready = wait_for_ports(&emulator.host, &ports, self.config.timeouts.emulator()).await;
        if ready {
            self.set_state(OrchestratorState::EmulatorReady, "Emulator is up");
        } else {
            log::warn!(
                "Emulator did not become ready within {}s, continuing anyway",
                self.config.timeouts.emulator_secs
            );
        }
        ready
    }

    /// Run the install step when the dev tool is missing
    async fn ensure_dependencies(&self) -> Result<(), LaunchError> {
        let Some(install) = &self.config.install else {
            return Ok(());
        };
        let root = &self.config.project_root;
        if !needs_install(root, &install.tool) {
            return Ok(());
        }

        let command = install.command_line();
        log::info!(
            "Local `{}` binary not found. Running `{}` to install dependencies...",
            install.tool,
            command
        );
        let program = resolve_program(&install.program, root)?;
        let status = tokio::process::Command::new(program)
            .args(&install.args)
            .current_dir(root)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| LaunchError::InstallSpawn {
                command: command.clone(),
                source,
            })?;

        if !status.success() {
            return Err(LaunchError::InstallFailed {
                command,
                code: status.code(),
            });
        }
        Ok(())
    }

    fn spawn_primary(&mut self) -> Result<(u32, mpsc::UnboundedReceiver<String>), LaunchError> {
        let root = self.config.project_root.clone();
        let program = resolve_program(&self.config.command.program, &root)?;

        let mut env = self.config.env.clone();
        if self.options.emulator {
            env.insert(self.config.emulator.env_flag.clone(), "true".to_string());
        }

        let config = ProcessConfig::new(PRIMARY, program)
            .args(self.config.command.args.clone())
            .envs(env)
            .working_dir(root)
            .output(OutputMode::Merged);

        let process = self.processes.spawn(config)?;
        let pid = process.pid.unwrap_or(0);
        let output = process
            .take_output()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        Ok((pid, output))
    }

    /// URL to try when nothing with a port was announced in time
    async fn fallback_url(&self, pid: u32, detected: &DetectedUrls) -> (String, UrlSource) {
        let table = self.socket_table.clone();
        let owned = tokio::task::spawn_blocking(move || table.ports_owned_by(&process_tree(pid)))
            .await;
        let ports = match owned {
            Ok(Ok(ports)) => ports,
            Ok(Err(e)) => {
                log::warn!("Could not map PID {} to a port: {}", pid, e);
                BTreeSet::new()
            }
            Err(e) => {
                log::warn!("Port lookup aborted: {}", e);
                BTreeSet::new()
            }
        };

        let (url, source) = choose_fallback(
            &self.config.host,
            &ports,
            detected.first_implicit(),
            self.config.default_url(),
        );
        match source {
            UrlSource::Default => {
                log::warn!("No server URL detected; trying default {} ...", url)
            }
            _ => log::info!("No URL announced; using {} ({:?})", url, source),
        }
        (url, source)
    }

    fn open_browser(&self, url: &str) {
        if !self.config.open_browser {
            log::info!("Browser disabled, server is at {}", url);
            return;
        }
        if let Err(e) = self.browser.open(url) {
            log::warn!("Failed to open browser: {}. Visit {} manually.", e, url);
        }
    }
}

/// Fallback order: lowest owned port, then an announced URL without a port, then the default
pub fn choose_fallback(
    host: &str,
    owned_ports: &BTreeSet<u16>,
    implicit: Option<String>,
    default_url: String,
) -> (String, UrlSource) {
    if let Some(port) = owned_ports.first() {
        return (format!("http://{}:{}/", host, port), UrlSource::SocketTable);
    }
    if let Some(url) = implicit {
        return (url, UrlSource::ImplicitCandidate);
    }
    (default_url, UrlSource::Default)
}

/// Whether the dev tool is missing both locally and on PATH
pub fn needs_install(project_root: &Path, tool: &str) -> bool {
    let bin = project_root.join("node_modules").join(".bin");
    let local = bin.join(tool).exists() || bin.join(format!("{}.cmd", tool)).exists();
    !local && which::which(tool).is_err()
}

/// Locate `program` on PATH (or relative to `cwd` if it contains a path separator)
pub fn resolve_program(program: &str, cwd: &Path) -> Result<PathBuf, LaunchError> {
    which::which_in(program, std::env::var_os("PATH"), cwd).map_err(|_| {
        LaunchError::ExecutableNotFound {
            program: program.to_string(),
        }
    })
}

/// Await `fut` unless a shutdown is signalled first
async fn until_shutdown<F: Future>(shutdown: &mut watch::Receiver<()>, fut: F) -> Option<F::Output> {
    tokio::select! {
        out = fut => Some(out),
        Ok(()) = shutdown.changed() => None,
    }
}

/// Fatal launcher errors
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("`{program}` not found")]
    ExecutableNotFound { program: String },

    #[error("Failed to run `{command}`: {source}")]
    InstallSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with exit code {code:?}")]
    InstallFailed { command: String, code: Option<i32> },

    #[error("Failed to start dev server: {0}")]
    Spawn(#[from] ProcessError),

    #[error("Failed to create HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

impl LaunchError {
    /// What the operator should do about it
    pub fn remediation(&self) -> Option<String> {
        match self {
            LaunchError::ExecutableNotFound { program } => Some(format!(
                "Make sure `{}` is installed and available in your PATH. \
                 Node.js tooling can be downloaded from https://nodejs.org/",
                program
            )),
            LaunchError::InstallSpawn { command, .. } | LaunchError::InstallFailed { command, .. } => {
                Some(format!(
                    "Please run `{}` manually and then re-run dev_launch.",
                    command
                ))
            }
            LaunchError::Config(_) => Some("Check dev_launch.yaml and the command-line flags.".to_string()),
            LaunchError::Spawn(_) | LaunchError::Http(_) => None,
        }
    }
}
