//! Port reaper - finds and kills processes still holding the dev server ports
//!
//! Dev servers often leave orphaned listeners behind after an abrupt exit. Reaping is
//! best effort: a socket table that cannot be read counts as empty and a process that
//! is already gone is only logged.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Inclusive range of TCP ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortRangeRepr", into = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRangeRepr {
    Single(u16),
    Text(String),
}

impl TryFrom<PortRangeRepr> for PortRange {
    type Error = String;

    fn try_from(repr: PortRangeRepr) -> Result<Self, Self::Error> {
        match repr {
            PortRangeRepr::Single(port) => {
                let range = PortRange::single(port);
                range.validate()?;
                Ok(range)
            }
            PortRangeRepr::Text(s) => s.parse(),
        }
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.start == 0 {
            return Err("port 0 is not a valid port".to_string());
        }
        if self.start > self.end {
            return Err(format!(
                "port range {}-{} is reversed",
                self.start, self.end
            ));
        }
        Ok(())
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Parse `5173` or `5173-5180`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("Invalid port '{}'", p.trim()))
        };

        let range = match s.split_once('-') {
            Some((start, end)) => PortRange::new(parse_port(start)?, parse_port(end)?),
            None => PortRange::single(parse_port(s)?),
        };
        range.validate()?;
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A socket found in the OS socket table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// Local address as printed by the OS tool (e.g. `127.0.0.1`, `*`, `[::1]`)
    pub host: String,
    /// Local port
    pub port: u16,
    /// Owning process
    pub pid: u32,
}

/// Source of listening/established TCP sockets
pub trait SocketTable: Send + Sync {
    /// Every TCP socket in LISTEN or ESTABLISHED state, keyed by local port
    fn bindings(&self) -> Result<Vec<PortBinding>, EnumerationError>;

    /// Local ports held by any process in `pids`
    fn ports_owned_by(&self, pids: &HashSet<u32>) -> Result<BTreeSet<u16>, EnumerationError> {
        Ok(self
            .bindings()?
            .into_iter()
            .filter(|b| pids.contains(&b.pid))
            .map(|b| b.port)
            .collect())
    }
}

/// Socket table read through `lsof` (Unix) or `netstat -ano` (Windows)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSocketTable;

impl SocketTable for SystemSocketTable {
    #[cfg(unix)]
    fn bindings(&self) -> Result<Vec<PortBinding>, EnumerationError> {
        // lsof exits 1 when nothing matches, so only stdout matters
        let output = run_tool(
            "lsof",
            &["-nP", "-iTCP", "-sTCP:LISTEN,ESTABLISHED", "-F", "pn"],
        )?;
        Ok(parse_lsof(&output))
    }

    #[cfg(windows)]
    fn bindings(&self) -> Result<Vec<PortBinding>, EnumerationError> {
        let output = run_tool("netstat", &["-ano"])?;
        Ok(parse_netstat(&output))
    }
}

fn run_tool(tool: &str, args: &[&str]) -> Result<String, EnumerationError> {
    let output = std::process::Command::new(tool)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .map_err(|e| EnumerationError::Unavailable {
            tool: tool.to_string(),
            source: e,
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `lsof -F pn` output.
///
/// Records are a `p<pid>` line followed by `f<fd>` / `n<name>` lines, where the name
/// is `local` or `local->remote`.
pub fn parse_lsof(output: &str) -> Vec<PortBinding> {
    let mut bindings = Vec::new();
    let mut pid: Option<u32> = None;

    for line in output.lines() {
        let Some(tag) = line.chars().next() else {
            continue;
        };
        let value = &line[tag.len_utf8()..];
        match tag {
            'p' => pid = value.parse().ok(),
            'n' => {
                let Some(pid) = pid else { continue };
                let local = value.split("->").next().unwrap_or(value);
                if let Some((host, port)) = split_host_port(local) {
                    bindings.push(PortBinding { host, port, pid });
                }
            }
            _ => {}
        }
    }

    bindings
}

/// Parse Windows `netstat -ano` output.
///
/// ```text
///   TCP    0.0.0.0:5173     0.0.0.0:0      LISTENING     1234
///   TCP    [::1]:5173       [::1]:50123    ESTABLISHED   1234
/// ```
pub fn parse_netstat(output: &str) -> Vec<PortBinding> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 || !parts[0].eq_ignore_ascii_case("tcp") {
                return None;
            }
            // State names are localized; closed sockets report PID 0
            let pid = parts[parts.len() - 1].parse::<u32>().ok().filter(|pid| *pid != 0)?;
            let (host, port) = split_host_port(parts[1])?;
            Some(PortBinding { host, port, pid })
        })
        .collect()
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.trim().rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

/// The process and all of its descendants.
///
/// Package managers start the real server as a grandchild, so the ports it binds are
/// owned by a descendant of the spawned process.
pub fn process_tree(root: u32) -> HashSet<u32> {
    use sysinfo::{ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut tree = HashSet::from([root]);
    loop {
        let before = tree.len();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                if tree.contains(&parent.as_u32()) {
                    tree.insert(pid.as_u32());
                }
            }
        }
        if tree.len() == before {
            break;
        }
    }
    tree
}

/// Forced process termination
pub trait ProcessKiller: Send + Sync {
    fn kill(&self, pid: u32) -> Result<(), KillError>;
}

/// Kills with SIGKILL (Unix) or `taskkill /F` (Windows)
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalKiller;

impl ProcessKiller for SignalKiller {
    #[cfg(unix)]
    fn kill(&self, pid: u32) -> Result<(), KillError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| KillError::Failed {
            pid,
            reason: "pid out of range".to_string(),
        })?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(KillError::AlreadyGone(pid)),
            Err(e) => Err(KillError::Failed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    #[cfg(windows)]
    fn kill(&self, pid: u32) -> Result<(), KillError> {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map_err(|e| KillError::Failed {
                pid,
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(KillError::AlreadyGone(pid))
        }
    }
}

/// Result of a kill pass
#[derive(Debug, Default)]
pub struct KillReport {
    pub killed: Vec<u32>,
    pub failed: Vec<KillError>,
}

/// Finds and kills the owners of a port range
#[derive(Clone)]
pub struct PortReaper {
    table: Arc<dyn SocketTable>,
    killer: Arc<dyn ProcessKiller>,
}

impl PortReaper {
    pub fn new(table: Arc<dyn SocketTable>, killer: Arc<dyn ProcessKiller>) -> Self {
        Self { table, killer }
    }

    /// Processes bound to any port in `range`, excluding this process.
    ///
    /// Enumeration failures yield an empty set.
    pub fn find_pids(&self, range: PortRange) -> BTreeSet<u32> {
        let own_pid = std::process::id();
        match self.table.bindings() {
            Ok(bindings) => bindings
                .into_iter()
                .filter(|b| range.contains(b.port) && b.pid != own_pid)
                .map(|b| b.pid)
                .collect(),
            Err(e) => {
                log::warn!("Could not list sockets on port {}: {}", range, e);
                BTreeSet::new()
            }
        }
    }

    /// Force-kill every pid; failures are logged and do not stop the pass
    pub fn kill(&self, pids: &BTreeSet<u32>) -> KillReport {
        let mut report = KillReport::default();
        for &pid in pids {
            log::info!("Killing PID {}...", pid);
            match self.killer.kill(pid) {
                Ok(()) => report.killed.push(pid),
                Err(e) => {
                    log::warn!("{}", e);
                    report.failed.push(e);
                }
            }
        }
        report
    }

    /// Find and kill everything bound in `range`
    pub fn reap(&self, range: PortRange) -> KillReport {
        let pids = self.find_pids(range);
        if pids.is_empty() {
            log::info!("No processes found on port {}.", range);
            return KillReport::default();
        }

        log::info!(
            "Found {} process(es) on port {}: {}",
            pids.len(),
            range,
            pids.iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.kill(&pids)
    }
}

/// Socket enumeration failures
#[derive(Debug, thiserror::Error)]
pub enum EnumerationError {
    #[error("socket listing tool '{tool}' is unavailable: {source}")]
    Unavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read socket table: {0}")]
    Failed(String),
}

/// Kill failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KillError {
    #[error("Failed to kill PID {0} (may already be gone)")]
    AlreadyGone(u32),

    #[error("Failed to kill PID {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeTable(Result<Vec<PortBinding>, ()>);

    impl SocketTable for FakeTable {
        fn bindings(&self) -> Result<Vec<PortBinding>, EnumerationError> {
            self.0
                .clone()
                .map_err(|_| EnumerationError::Failed("boom".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingKiller {
        calls: Mutex<Vec<u32>>,
        gone: HashSet<u32>,
    }

    impl ProcessKiller for RecordingKiller {
        fn kill(&self, pid: u32) -> Result<(), KillError> {
            self.calls.lock().unwrap().push(pid);
            if self.gone.contains(&pid) {
                Err(KillError::AlreadyGone(pid))
            } else {
                Ok(())
            }
        }
    }

    fn binding(port: u16, pid: u32) -> PortBinding {
        PortBinding {
            host: "127.0.0.1".to_string(),
            port,
            pid,
        }
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!("5173".parse::<PortRange>(), Ok(PortRange::single(5173)));
        assert_eq!(
            "5173-5180".parse::<PortRange>(),
            Ok(PortRange::new(5173, 5180))
        );
        assert!("5180-5173".parse::<PortRange>().is_err());
        assert!("0".parse::<PortRange>().is_err());
        assert!("http".parse::<PortRange>().is_err());
        assert_eq!(PortRange::new(1, 3).to_string(), "1-3");
        assert!(PortRange::new(1, 3).contains(3));
        assert!(!PortRange::new(1, 3).contains(4));
    }

    #[test]
    fn test_parse_lsof() {
        let output = "p1234\nf22\nn*:5173\np5678\nf30\nn127.0.0.1:5173->127.0.0.1:60211\nf31\nn[::1]:9000\n";
        assert_eq!(
            parse_lsof(output),
            vec![
                PortBinding {
                    host: "*".to_string(),
                    port: 5173,
                    pid: 1234
                },
                binding(5173, 5678),
                PortBinding {
                    host: "[::1]".to_string(),
                    port: 9000,
                    pid: 5678
                },
            ]
        );
    }

    #[test]
    fn test_parse_lsof_matches_local_port_only() {
        let output = "p42\nf7\nn127.0.0.1:60211->127.0.0.1:5173\n";
        let bindings = parse_lsof(output);
        assert_eq!(bindings, vec![binding(60211, 42)]);
    }

    #[test]
    fn test_parse_netstat() {
        let output = "\r\nActive Connections\r\n\r\n  Proto  Local Address          Foreign Address        State           PID\r\n  TCP    0.0.0.0:5173           0.0.0.0:0              LISTENING       1234\r\n  TCP    [::1]:5173             [::1]:50123            ESTABLISHED     1234\r\n  TCP    127.0.0.1:50000        127.0.0.1:5173         TIME_WAIT       0\r\n  UDP    0.0.0.0:5353           *:*                                    999\r\n";
        assert_eq!(
            parse_netstat(output),
            vec![
                PortBinding {
                    host: "0.0.0.0".to_string(),
                    port: 5173,
                    pid: 1234
                },
                PortBinding {
                    host: "[::1]".to_string(),
                    port: 5173,
                    pid: 1234
                },
            ]
        );
    }

    #[test]
    fn test_parse_netstat_localized_state() {
        let output = "  TCP    0.0.0.0:5173    0.0.0.0:0    ABH\u{d6}REN    1234\r\n  TCP    127.0.0.1:50000    127.0.0.1:5173    WARTEND    0\r\n";
        assert_eq!(
            parse_netstat(output),
            vec![PortBinding {
                host: "0.0.0.0".to_string(),
                port: 5173,
                pid: 1234
            }]
        );
    }

    #[test]
    fn test_reap_tolerates_already_gone() {
        let table = FakeTable(Ok(vec![
            binding(5173, 100),
            binding(5173, 200),
            binding(9000, 300),
        ]));
        let killer = Arc::new(RecordingKiller {
            gone: HashSet::from([100]),
            ..Default::default()
        });
        let reaper = PortReaper::new(Arc::new(table), killer.clone());

        let report = reaper.reap(PortRange::single(5173));

        assert_eq!(*killer.calls.lock().unwrap(), vec![100, 200]);
        assert_eq!(report.killed, vec![200]);
        assert_eq!(report.failed, vec![KillError::AlreadyGone(100)]);
    }

    #[test]
    fn test_reap_range_and_own_pid() {
        let own = std::process::id();
        let table = FakeTable(Ok(vec![
            binding(5173, 100),
            binding(5175, 200),
            binding(5176, 300),
            binding(5174, own),
        ]));
        let reaper = PortReaper::new(Arc::new(table), Arc::new(RecordingKiller::default()));

        let pids = reaper.find_pids(PortRange::new(5173, 5175));
        assert_eq!(pids, BTreeSet::from([100, 200]));
    }

    #[test]
    fn test_enumeration_failure_is_empty() {
        let killer = Arc::new(RecordingKiller::default());
        let reaper = PortReaper::new(Arc::new(FakeTable(Err(()))), killer.clone());

        let report = reaper.reap(PortRange::single(5173));
        assert!(report.killed.is_empty());
        assert!(killer.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ports_owned_by() {
        let table = FakeTable(Ok(vec![
            binding(5174, 10),
            binding(24678, 11),
            binding(5173, 11),
            binding(80, 99),
        ]));
        let ports = table.ports_owned_by(&HashSet::from([10, 11])).unwrap();
        assert_eq!(ports, BTreeSet::from([5173, 5174, 24678]));
    }

    #[test]
    fn test_process_tree_contains_root() {
        let own = std::process::id();
        assert!(process_tree(own).contains(&own));
    }
}
