//! Readiness prober - TCP connect checks and HTTP liveness polling
//!
//! Probes never fail loudly: every transport error just means "not ready yet".

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Interval between polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-request timeout for HTTP probes
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the single diagnostic request on the degraded path
pub const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(3);

/// Try a TCP connect to every address `host` resolves to.
///
/// Bracketed IPv6 hosts are accepted.
pub async fn socket_check(host: &str, port: u16, timeout: Duration) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => addrs,
        Err(e) => {
            log::debug!("Could not resolve {}: {}", host, e);
            return false;
        }
    };

    for addr in addrs {
        if let Ok(Ok(_stream)) = tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            return true;
        }
    }
    false
}

/// Poll until every port on `host` accepts connections or `timeout` elapses
pub async fn wait_for_ports(host: &str, ports: &[u16], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let mut all_up = true;
        for &port in ports {
            if !socket_check(host, port, ATTEMPT_TIMEOUT).await {
                all_up = false;
                break;
            }
        }
        if all_up {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// HTTP readiness checks against a candidate URL
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    interval: Duration,
}

impl ReadinessProber {
    /// Create a prober with the default per-attempt timeout
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(ATTEMPT_TIMEOUT)
    }

    pub fn with_timeout(attempt_timeout: Duration) -> Result<Self, reqwest::Error> {
        // Dev servers are local; never route probes through a configured proxy
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            interval: POLL_INTERVAL,
        })
    }

    /// Single GET; ready if the status is below 400
    pub async fn probe_http(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().as_u16() < 400,
            Err(e) => {
                log::trace!("Probe of {} failed: {}", url, e);
                false
            }
        }
    }

    /// Poll `url` until it answers below 400 or `timeout` elapses
    pub async fn wait_for_server(&self, url: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if let Ok(true) = tokio::time::timeout(remaining, self.probe_http(url)).await {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// One request for operator-visible error detail
    pub async fn diagnose(&self, url: &str) -> Result<reqwest::StatusCode, reqwest::Error> {
        let resp = self
            .client
            .get(url)
            .timeout(DIAGNOSTIC_TIMEOUT)
            .send()
            .await?;
        Ok(resp.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every connection with the given status line
    async fn serve(listener: TcpListener, status: &'static str) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_socket_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(socket_check("127.0.0.1", port, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!socket_check("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_wait_for_ports() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ports = [a.local_addr().unwrap().port(), b.local_addr().unwrap().port()];
        assert!(wait_for_ports("127.0.0.1", &ports, Duration::from_secs(2)).await);

        drop(b);
        let start = std::time::Instant::now();
        assert!(!wait_for_ports("127.0.0.1", &ports, Duration::from_millis(600)).await);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_wait_for_server_becomes_ready() {
        let port = free_port().await;
        let url = format!("http://127.0.0.1:{}/", port);

        // Server comes up after one second
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            serve(listener, "200 OK").await;
        });

        let prober = ReadinessProber::new().unwrap();
        let start = std::time::Instant::now();
        assert!(prober.wait_for_server(&url, Duration::from_secs(5)).await);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_wait_for_server_times_out() {
        let port = free_port().await;
        let url = format!("http://127.0.0.1:{}/", port);

        let prober = ReadinessProber::new().unwrap();
        let start = std::time::Instant::now();
        assert!(!prober.wait_for_server(&url, Duration::from_secs(1)).await);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_error_status_is_not_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, "503 Service Unavailable"));

        let prober = ReadinessProber::new().unwrap();
        assert!(!prober.probe_http(&url).await);
        assert!(!prober.wait_for_server(&url, Duration::from_millis(700)).await);
        assert_eq!(
            prober.diagnose(&url).await.unwrap(),
            reqwest::StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_success_status_is_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, "204 No Content"));

        let prober = ReadinessProber::new().unwrap();
        assert!(prober.probe_http(&url).await);
    }
}
