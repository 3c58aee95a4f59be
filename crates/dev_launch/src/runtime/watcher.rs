//! Log stream watcher - echoes child output and picks out the URL it announces

use regex::Regex;
use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// ANSI/VT escape sequences (two-byte escapes and CSI sequences)
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap());

/// `scheme://host[:port]` where host may be a bracketed IPv6 literal
static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(https?)://)(\[[^\]\s]+\]|[^:/\s\[\]]+)(?::(\d{1,5}))?").unwrap()
});

/// A normalized URL found in a log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUrl {
    /// `scheme://host[:port]/`
    pub url: String,
    /// Explicit port, if the line carried one
    pub port: Option<u16>,
}

impl CandidateUrl {
    pub fn has_explicit_port(&self) -> bool {
        self.port.is_some()
    }
}

impl fmt::Display for CandidateUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Remove terminal escape sequences
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

/// Build `scheme://host[:port]/`, bracketing bare IPv6 hosts
pub fn normalize_url(scheme: Option<&str>, host: &str, port: Option<u16>) -> String {
    let scheme = scheme.filter(|s| !s.is_empty()).unwrap_or("http");
    let host: Cow<'_, str> = if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{}]", host))
    } else {
        Cow::Borrowed(host)
    };

    let url = match port {
        Some(port) => format!("{}://{}:{}", scheme, host, port),
        None => format!("{}://{}", scheme, host),
    };
    format!("{}/", url.trim_end_matches('/'))
}

/// First URL in a log line, after stripping escape sequences
pub fn extract_candidate(line: &str) -> Option<CandidateUrl> {
    let clean = strip_ansi(line);
    let caps = URL_PATTERN.captures(&clean)?;

    let scheme = caps.get(1).map(|m| m.as_str());
    let host = caps.get(2)?.as_str();
    let port = match caps.get(3) {
        Some(m) => Some(m.as_str().parse::<u16>().ok().filter(|p| *p != 0)?),
        None => None,
    };

    Some(CandidateUrl {
        url: normalize_url(scheme, host, port),
        port,
    })
}

/// URL state shared between the watcher task and the orchestrator.
///
/// The selected URL is set at most once; the candidate list is append-only.
#[derive(Clone)]
pub struct DetectedUrls {
    selected: Arc<watch::Sender<Option<String>>>,
    candidates: Arc<Mutex<Vec<CandidateUrl>>>,
}

impl Default for DetectedUrls {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectedUrls {
    pub fn new() -> Self {
        let (selected, _) = watch::channel(None);
        Self {
            selected: Arc::new(selected),
            candidates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append a candidate; an explicit-port candidate becomes the selection if none exists.
    ///
    /// Returns `true` if this call made the selection.
    pub fn record(&self, candidate: CandidateUrl) -> bool {
        let url = candidate.has_explicit_port().then(|| candidate.url.clone());
        self.candidates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(candidate);
        url.is_some_and(|url| self.select(url))
    }

    /// Set the selected URL unless one is already set
    pub fn select(&self, url: String) -> bool {
        self.selected.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(url);
                true
            } else {
                false
            }
        })
    }

    /// Current selection, without blocking
    pub fn selected(&self) -> Option<String> {
        self.selected.borrow().clone()
    }

    pub fn is_selected(&self) -> bool {
        self.selected.borrow().is_some()
    }

    /// Wait up to `timeout` for a selection
    pub async fn wait(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.selected.subscribe();
        let waited = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => (*value).clone(),
            _ => None,
        };
        waited.or_else(|| self.selected())
    }

    /// Snapshot of every candidate seen so far
    pub fn candidates(&self) -> Vec<CandidateUrl> {
        self.candidates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First candidate that had no explicit port
    pub fn first_implicit(&self) -> Option<String> {
        self.candidates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| !c.has_explicit_port())
            .map(|c| c.url.clone())
    }
}

/// Echoes every line to `sink` and records URLs until one with a port is selected
pub struct LogWatcher<W> {
    detected: DetectedUrls,
    sink: W,
}

impl<W: Write> LogWatcher<W> {
    pub fn new(detected: DetectedUrls, sink: W) -> Self {
        Self { detected, sink }
    }

    /// Echo one line verbatim, then parse it if no URL is selected yet
    pub fn handle_line(&mut self, line: &str) -> Option<CandidateUrl> {
        // The operator must see boot logs even if the console is gone
        let _ = writeln!(self.sink, "{}", line);
        let _ = self.sink.flush();

        if self.detected.is_selected() {
            return None;
        }

        let candidate = extract_candidate(line)?;
        log::debug!("URL candidate: {}", candidate);
        if self.detected.record(candidate.clone()) {
            log::debug!("Selected URL: {}", candidate);
        }
        Some(candidate)
    }

    /// Consume lines until the stream closes
    pub async fn run(mut self, mut lines: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = lines.recv().await {
            self.handle_line(&line);
        }
        log::debug!("Output stream closed");
    }
}

impl<W: Write + Send + 'static> LogWatcher<W> {
    /// Run on its own task
    pub fn spawn(self, lines: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(self.run(lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher() -> (LogWatcher<Vec<u8>>, DetectedUrls) {
        let detected = DetectedUrls::new();
        (LogWatcher::new(detected.clone(), Vec::new()), detected)
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(
            strip_ansi("\x1b[32m  ➜  \x1b[1mLocal\x1b[22m:\x1b[39m   \x1b[36mhttp://localhost:\x1b[1m5173\x1b[22m/\x1b[39m"),
            "  ➜  Local:   http://localhost:5173/"
        );
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_extract_path_is_dropped() {
        let c = extract_candidate("see http://host:1234/path?q=1").unwrap();
        assert_eq!(c.url, "http://host:1234/");
        assert_eq!(c.port, Some(1234));
    }

    #[test]
    fn test_extract_colored_vite_banner() {
        let line = "  \x1b[32m➜\x1b[39m  \x1b[1mLocal\x1b[22m:   \x1b[36mhttp://localhost:\x1b[1m5173\x1b[22m/\x1b[39m";
        assert_eq!(
            extract_candidate(line).unwrap().url,
            "http://localhost:5173/"
        );
    }

    #[test]
    fn test_extract_ipv6_and_https() {
        let c = extract_candidate("Network: https://[::1]:8443").unwrap();
        assert_eq!(c.url, "https://[::1]:8443/");

        let c = extract_candidate("ready at http://example.test").unwrap();
        assert_eq!(c.url, "http://example.test/");
        assert_eq!(c.port, None);
    }

    #[test]
    fn test_extract_rejects_out_of_range_port() {
        assert_eq!(extract_candidate("http://localhost:99999/"), None);
        assert_eq!(extract_candidate("nothing to see here"), None);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url(None, "localhost", Some(80)), "http://localhost:80/");
        assert_eq!(normalize_url(Some("http"), "::1", Some(3000)), "http://[::1]:3000/");
        assert_eq!(normalize_url(Some("https"), "[fe80::1]", None), "https://[fe80::1]/");
    }

    #[test]
    fn test_line_without_url_is_echoed() {
        let (mut watcher, detected) = watcher();
        assert_eq!(watcher.handle_line("> vite"), None);
        assert_eq!(String::from_utf8(watcher.sink.clone()).unwrap(), "> vite\n");
        assert!(detected.candidates().is_empty());
        assert_eq!(detected.selected(), None);
    }

    #[test]
    fn test_single_candidate_per_line() {
        let (mut watcher, detected) = watcher();
        watcher.handle_line("Local: http://host:1234/path  Network: http://10.0.0.2:1234/");
        assert_eq!(
            detected.candidates(),
            vec![CandidateUrl {
                url: "http://host:1234/".to_string(),
                port: Some(1234)
            }]
        );
        assert_eq!(detected.selected().as_deref(), Some("http://host:1234/"));
    }

    #[test]
    fn test_selection_is_idempotent() {
        let (mut watcher, detected) = watcher();
        watcher.handle_line("docs at https://vitejs.dev");
        assert_eq!(detected.selected(), None);

        watcher.handle_line("Local: http://localhost:4321/");
        watcher.handle_line("Local: http://localhost:9999/");
        assert!(!detected.select("http://other:1/".to_string()));

        assert_eq!(detected.selected().as_deref(), Some("http://localhost:4321/"));
        assert_eq!(detected.candidates().len(), 2);
        assert_eq!(
            detected.first_implicit().as_deref(),
            Some("https://vitejs.dev/")
        );

        let echoed = String::from_utf8(watcher.sink).unwrap();
        assert_eq!(echoed.lines().count(), 3);
        assert!(echoed.ends_with("Local: http://localhost:9999/\n"));
    }

    #[tokio::test]
    async fn test_wait_times_out_without_selection() {
        let detected = DetectedUrls::new();
        let start = std::time::Instant::now();
        assert_eq!(detected.wait(Duration::from_millis(100)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_run_signals_waiter() {
        let (watcher, detected) = watcher();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = watcher.spawn(rx);

        tx.send("starting...".to_string()).unwrap();
        tx.send("  Local:   http://localhost:5173/".to_string()).unwrap();

        let url = detected.wait(Duration::from_secs(5)).await;
        assert_eq!(url.as_deref(), Some("http://localhost:5173/"));

        drop(tx);
        handle.await.unwrap();
    }
}
