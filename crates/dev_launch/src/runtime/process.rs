//! Managed process abstraction

use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is pending start
    Pending,
    /// Process is running
    Running,
    /// Process has stopped with exit code
    Stopped(Option<i32>),
    /// Process failed to start
    Failed,
}

impl ProcessStatus {
    /// Check if process is running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

/// Where the child's stdout/stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Share the launcher's console
    #[default]
    Inherit,
    /// Merge stdout and stderr into one line stream, see [`ManagedProcess::take_output`]
    Merged,
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path
    pub executable: PathBuf,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables added to the inherited environment
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Output handling
    pub output: OutputMode,
}

impl ProcessConfig {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            output: OutputMode::Inherit,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Command line for log messages
    pub fn display_command(&self) -> String {
        std::iter::once(self.executable.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A managed child process
pub struct ManagedProcess {
    /// Process configuration
    pub config: ProcessConfig,
    /// Current status
    pub status: ProcessStatus,
    /// Process ID (if running)
    pub pid: Option<u32>,
    /// Start time
    pub started_at: Option<Instant>,
    /// Process group (the leader's PID), kept until the group is terminated
    pgid: Option<u32>,
    /// Child process handle
    child: Option<Child>,
    /// Merged output lines, until taken by a watcher
    output: Option<mpsc::UnboundedReceiver<String>>,
}

impl ManagedProcess {
    /// Create a new managed process
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            status: ProcessStatus::Pending,
            pid: None,
            started_at: None,
            pgid: None,
            child: None,
            output: None,
        }
    }

    /// Start the process
    pub fn start(&mut self) -> Result<u32, ProcessError> {
        if self.status.is_running() {
            return Err(ProcessError::AlreadyRunning(self.config.name.clone()));
        }

        log::info!(
            "[{}] Starting: {}",
            self.config.name,
            self.config.display_command()
        );

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if self.config.output == OutputMode::Merged {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        // Own process group, so termination reaches the whole tree
        #[cfg(unix)]
        cmd.process_group(0);

        match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id().unwrap_or(0);
                self.pid = Some(pid);
                self.pgid = Some(pid);
                self.status = ProcessStatus::Running;
                self.started_at = Some(Instant::now());

                if self.config.output == OutputMode::Merged {
                    let (tx, rx) = mpsc::unbounded_channel();
                    if let Some(stdout) = child.stdout.take() {
                        tokio::spawn(forward_lines(stdout, tx.clone()));
                    }
                    if let Some(stderr) = child.stderr.take() {
                        tokio::spawn(forward_lines(stderr, tx));
                    }
                    self.output = Some(rx);
                }

                log::debug!("[{}] Started with PID {}", self.config.name, pid);
                self.child = Some(child);
                Ok(pid)
            }
            Err(e) => {
                self.status = ProcessStatus::Failed;
                Err(ProcessError::SpawnFailed {
                    name: self.config.name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Take the merged output stream (only once, only in [`OutputMode::Merged`])
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output.take()
    }

    /// Wait for the process to exit on its own.
    ///
    /// Cancel-safe: dropping the future leaves the process running and managed.
    pub async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        let Some(child) = self.child.as_mut() else {
            return match self.status {
                ProcessStatus::Stopped(code) => Ok(code),
                _ => Err(ProcessError::NotRunning(self.config.name.clone())),
            };
        };

        let status = child.wait().await.map_err(|e| ProcessError::Wait {
            name: self.config.name.clone(),
            source: e,
        })?;
        let code = status.code();
        self.status = ProcessStatus::Stopped(code);
        self.child = None;
        self.pid = None;
        log::info!("[{}] Process exited with code: {:?}", self.config.name, code);
        Ok(code)
    }

    /// Stop the process and its group (SIGTERM, then SIGKILL after timeout).
    ///
    /// Group members are signalled even after the leader has exited, so a wrapper
    /// that died does not leave its server behind. Safe to call repeatedly; returns
    /// `true` only if something live was stopped.
    pub async fn terminate(&mut self, timeout: Duration) -> bool {
        let Some(pgid) = self.pgid.take() else {
            return false;
        };
        let mut child = self.child.take();
        self.pid = None;

        // Reaps an exited leader so it no longer counts as a group member
        let leader_running = match child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => {
                self.status = ProcessStatus::Stopped(status.code());
                false
            }
            Some(_) => true,
            None => false,
        };

        #[cfg(unix)]
        let signalled = signal_group(pgid, nix::sys::signal::Signal::SIGTERM);

        #[cfg(windows)]
        let signalled = leader_running && kill_tree(pgid).await;

        if !leader_running && !signalled {
            return false;
        }

        log::info!(
            "[{}] Stopping process (up {:.1?})...",
            self.config.name,
            self.uptime().unwrap_or_default()
        );
        let deadline = tokio::time::Instant::now() + timeout;

        let mut leader_stuck = false;
        if let Some(child) = child.as_mut().filter(|_| leader_running) {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    let code = status.code();
                    self.status = ProcessStatus::Stopped(code);
                    log::info!("[{}] Process exited with code: {:?}", self.config.name, code);
                }
                Ok(Err(e)) => {
                    log::error!("[{}] Error waiting for process: {}", self.config.name, e);
                    self.status = ProcessStatus::Stopped(None);
                }
                Err(_) => leader_stuck = true,
            }
        }

        #[cfg(unix)]
        let group_lingering = !wait_group_exit(pgid, deadline).await;

        #[cfg(windows)]
        let group_lingering = {
            let _ = deadline;
            false
        };

        if leader_stuck || group_lingering {
            log::warn!(
                "[{}] Process did not exit gracefully, forcing kill",
                self.config.name
            );

            #[cfg(unix)]
            signal_group(pgid, nix::sys::signal::Signal::SIGKILL);

            if let Some(child) = child.as_mut().filter(|_| leader_stuck) {
                let _ = child.kill().await;
                self.status = ProcessStatus::Stopped(None);
            }
        }

        true
    }

    /// Get uptime duration
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}

/// Forward lines from one pipe into the merged stream, decoding lossily
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
        }
    }
}

/// Signal every member of a process group; `false` if the group is gone
#[cfg(unix)]
fn signal_group(pgid: u32, signal: impl Into<Option<nix::sys::signal::Signal>>) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match i32::try_from(pgid) {
        Ok(raw) => killpg(Pid::from_raw(raw), signal).is_ok(),
        Err(_) => false,
    }
}

/// Poll until no member of the group is left or the deadline passes
#[cfg(unix)]
async fn wait_group_exit(pgid: u32, deadline: tokio::time::Instant) -> bool {
    loop {
        if !signal_group(pgid, None) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(windows)]
async fn kill_tree(pid: u32) -> bool {
    Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

/// All processes spawned by one launcher run, stopped together in reverse start order
pub struct ProcessGroup {
    processes: IndexMap<String, ManagedProcess>,
    shutdown_timeout: Duration,
}

impl ProcessGroup {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            processes: IndexMap::new(),
            shutdown_timeout,
        }
    }

    /// Start a process and track it under its config name
    pub fn spawn(&mut self, config: ProcessConfig) -> Result<&mut ManagedProcess, ProcessError> {
        let name = config.name.clone();
        if self
            .processes
            .get(&name)
            .is_some_and(|p| p.status.is_running())
        {
            return Err(ProcessError::AlreadyRunning(name));
        }

        let mut process = ManagedProcess::new(config);
        process.start()?;
        self.processes.insert(name.clone(), process);
        self.processes
            .get_mut(&name)
            .ok_or(ProcessError::NotRunning(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ManagedProcess> {
        self.processes.get_mut(name)
    }

    /// Stop every live process; returns the names actually stopped
    pub async fn shutdown(&mut self) -> Vec<String> {
        let mut stopped = Vec::new();
        for (name, process) in self.processes.iter_mut().rev() {
            if process.terminate(self.shutdown_timeout).await {
                stopped.push(name.clone());
            }
        }
        if !stopped.is_empty() {
            log::info!("All processes shut down");
        }
        stopped
    }

}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{0}' is not running")]
    NotRunning(String),

    #[error("Failed waiting for process '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
