//! Liveness probes

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::ProbeError;

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// True iff the health endpoint answered with a non-error status.
    /// Network failures are reported as `false`, never as an error.
    async fn probe(&self) -> bool;
}

/// `HEAD` request against the health endpoint.
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(origin: &Url, endpoint: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let url = origin
            .join(endpoint)
            .map_err(|e| ProbeError::Request(format!("invalid health endpoint {endpoint:?}: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Request(format!("HTTP client error: {e}")))?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Probe with the failure reason kept.
    pub async fn check(&self) -> Result<(), ProbeError> {
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(self.timeout)
                } else {
                    ProbeError::Request(e.to_string())
                }
            })?;

        // Any non-error answer counts, 3xx included
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.check().await {
            Ok(()) => {
                debug!(url = %self.url, "Server reachable");
                true
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Server unreachable");
                false
            }
        }
    }
}

/// Probe answering from a fixed script, for headless hosts and tests.
/// Once the script runs out the last answer repeats.
#[derive(Debug)]
pub struct ScriptedProbe {
    inner: Mutex<ScriptState>,
}

#[derive(Debug)]
struct ScriptState {
    script: VecDeque<bool>,
    last: bool,
    calls: Vec<tokio::time::Instant>,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            inner: Mutex::new(ScriptState {
                script: script.into_iter().collect(),
                last: false,
                calls: Vec::new(),
            }),
        }
    }

    /// Instants at which `probe` was called.
    pub fn calls(&self) -> Vec<tokio::time::Instant> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self) -> bool {
        let mut state = self.lock();
        state.calls.push(tokio::time::Instant::now());
        if let Some(next) = state.script.pop_front() {
            state.last = next;
        }
        state.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn probe_for(server: &MockServer, timeout: Duration) -> HttpProbe {
        let origin = Url::parse(&server.uri()).unwrap();
        HttpProbe::new(&origin, "/connectivity", timeout).unwrap()
    }

    #[tokio::test]
    async fn test_head_success_is_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/connectivity"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        assert!(probe_for(&server, Duration::from_secs(2)).probe().await);
    }

    #[tokio::test]
    async fn test_error_status_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/connectivity"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = probe_for(&server, Duration::from_secs(2));
        assert!(matches!(probe.check().await, Err(ProbeError::Status(503))));
        assert!(!probe.probe().await);
    }

    #[tokio::test]
    async fn test_not_modified_is_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/connectivity"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let probe = probe_for(&server, Duration::from_secs(2));
        assert!(probe.check().await.is_ok());
        assert!(probe.probe().await);
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let probe = probe_for(&server, Duration::from_millis(50));
        assert!(matches!(probe.check().await, Err(ProbeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // Nothing listens on port 9 of localhost in the test environment
        let origin = Url::parse("http://127.0.0.1:9").unwrap();
        let probe = HttpProbe::new(&origin, "/connectivity", Duration::from_millis(500)).unwrap();
        assert!(!probe.probe().await);
    }

    #[tokio::test]
    async fn test_scripted_probe_repeats_last_answer() {
        let probe = ScriptedProbe::new([true, false]);
        assert!(probe.probe().await);
        assert!(!probe.probe().await);
        assert!(!probe.probe().await);
        assert_eq!(probe.call_count(), 3);
    }
}
