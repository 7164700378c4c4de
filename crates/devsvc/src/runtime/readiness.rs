//! Readiness probes and the backoff loop that polls them

use crate::config::ReadinessSettings;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

/// A resolved readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Ready once a TCP connection to `addr` succeeds
    Tcp { addr: String },
    /// Ready once a GET on `url` returns a 2xx status
    Http { url: String },
    /// Ready once `path` exists
    File { path: PathBuf },
    /// Ready immediately
    None,
}

impl ReadinessProbe {
    /// Run a single probe attempt
    ///
    /// `http` is only consulted by HTTP probes.
    pub async fn check(&self, http: Option<&reqwest::Client>, attempt_timeout: Duration) -> bool {
        match self {
            ReadinessProbe::Tcp { addr } => matches!(
                tokio::time::timeout(attempt_timeout, TcpStream::connect(addr.as_str())).await,
                Ok(Ok(_))
            ),
            ReadinessProbe::Http { url } => {
                let Some(client) = http else {
                    return false;
                };
                match client.get(url).timeout(attempt_timeout).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(_) => false,
                }
            }
            ReadinessProbe::File { path } => tokio::fs::try_exists(path).await.unwrap_or(false),
            ReadinessProbe::None => true,
        }
    }

    /// Client shared by all attempts of an HTTP probe
    fn http_client(&self) -> Option<reqwest::Client> {
        if !matches!(self, ReadinessProbe::Http { .. }) {
            return None;
        }
        match reqwest::Client::builder().build() {
            Ok(client) => Some(client),
            Err(e) => {
                log::warn!("Failed to build HTTP client for readiness probe: {}", e);
                None
            }
        }
    }
}

impl fmt::Display for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessProbe::Tcp { addr } => write!(f, "tcp {}", addr),
            ReadinessProbe::Http { url } => write!(f, "http {}", url),
            ReadinessProbe::File { path } => write!(f, "file {}", path.display()),
            ReadinessProbe::None => write!(f, "none"),
        }
    }
}

/// Polling schedule for a readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    /// Deadline for the whole readiness phase
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::from(&ReadinessSettings::default())
    }
}

impl From<&ReadinessSettings> for ReadinessPolicy {
    fn from(settings: &ReadinessSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            attempt_timeout: Duration::from_millis(settings.attempt_timeout_ms),
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }
}

impl ReadinessPolicy {
    /// Same schedule with a different deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delays between attempts: doubling from `initial_delay`, capped at `max_delay`
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max = self.max_delay;
        std::iter::successors(Some(self.initial_delay.min(max)), move |d| {
            Some(d.saturating_mul(2).min(max))
        })
    }
}

/// Poll `probe` until it passes or the policy deadline elapses
///
/// Returns the number of attempts it took.
pub async fn wait_until_ready(
    probe: &ReadinessProbe,
    policy: &ReadinessPolicy,
) -> Result<u32, ReadinessError> {
    if *probe == ReadinessProbe::None {
        return Ok(0);
    }

    let http = probe.http_client();
    let mut attempts = 0u32;
    let poll = async {
        let mut delays = policy.delays();
        loop {
            attempts += 1;
            if probe.check(http.as_ref(), policy.attempt_timeout).await {
                return;
            }
            let delay = delays.next().unwrap_or(policy.max_delay);
            log::debug!(
                "Readiness probe '{}' not ready after attempt {}, retrying in {:?}",
                probe,
                attempts,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    };

    let outcome = tokio::time::timeout(policy.timeout, poll).await;
    match outcome {
        Ok(()) => Ok(attempts),
        Err(_) => Err(ReadinessError::Timeout {
            probe: probe.to_string(),
            timeout: policy.timeout,
            attempts,
        }),
    }
}

/// Errors that can occur while waiting for readiness
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Readiness probe '{probe}' did not pass within {timeout:?} ({attempts} attempts)")]
    Timeout {
        probe: String,
        timeout: Duration,
        attempts: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_policy(timeout_ms: u64) -> ReadinessPolicy {
        ReadinessPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(80),
            attempt_timeout: Duration::from_millis(100),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_default_policy_matches_settings() {
        let policy = ReadinessPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert_eq!(policy.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReadinessPolicy::default();
        let delays: Vec<_> = policy.delays().take(7).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200, 5000, 5000]);
    }

    #[tokio::test]
    async fn test_none_is_ready_immediately() {
        let attempts = wait_until_ready(&ReadinessProbe::None, &fast_policy(10))
            .await
            .unwrap();
        assert_eq!(attempts, 0);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let probe = ReadinessProbe::Tcp { addr };
        let attempts = wait_until_ready(&probe, &fast_policy(1_000)).await.unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_file_probe_waits_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");
        let probe = ReadinessProbe::File { path: path.clone() };

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tokio::fs::write(&path, b"ok").await.unwrap();
        });

        let attempts = wait_until_ready(&probe, &fast_policy(2_000)).await.unwrap();
        assert!(attempts > 1);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let probe = ReadinessProbe::File {
            path: dir.path().join("never"),
        };

        let started = Instant::now();
        let result = wait_until_ready(&probe, &fast_policy(300)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ReadinessError::Timeout { .. })));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1_000), "took {:?}", elapsed);
    }

    /// Accept connections and answer each with `response`, or hold them open when `None`
    async fn serve(response: Option<&'static str>) -> (String, tokio::task::JoinHandle<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                match response {
                    Some(response) => {
                        let _ = socket.write_all(response.as_bytes()).await;
                    }
                    None => held.push(socket),
                }
            }
        });
        (addr, server)
    }

    #[tokio::test]
    async fn test_http_probe_passes_on_success_status() {
        let (addr, server) =
            serve(Some("HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")).await;

        let probe = ReadinessProbe::Http {
            url: format!("http://{}/api/health", addr),
        };
        let attempts = wait_until_ready(&probe, &fast_policy(2_000)).await.unwrap();
        assert_eq!(attempts, 1);
        server.abort();
    }

    #[tokio::test]
    async fn test_http_attempts_are_bounded_by_attempt_timeout() {
        // The server accepts but never answers
        let (addr, server) = serve(None).await;

        let probe = ReadinessProbe::Http {
            url: format!("http://{}/", addr),
        };
        let result = wait_until_ready(&probe, &fast_policy(1_000)).await;
        match result {
            Err(ReadinessError::Timeout { attempts, .. }) => {
                assert!(attempts >= 3, "only {} attempts", attempts)
            }
            other => panic!("unexpected result {:?}", other),
        }
        server.abort();
    }
}
