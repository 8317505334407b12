//! Readiness probing of a sandbox's control endpoint.
//!
//! After a launch or restart the prober waits a grace period, then polls the
//! control port under the readiness retry policy. Any non-success response
//! or network error means "not yet ready" and is retried; exhausting the
//! budget yields [`FleetError::ReadinessTimeout`]. The prober never tears
//! anything down itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FleetError;
use crate::ports::PortSet;
use crate::retry::{RetryPolicy, execute_counting};

/// Why a single probe did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    /// The service answered with a failure or could not be reached.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The probe itself is misconfigured; retrying cannot help.
    #[error("probe failed: {0}")]
    Fatal(String),
}

impl ProbeError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }
}

/// One health check against a sandbox.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self, name: &str, ports: &PortSet) -> Result<(), ProbeError>;
}

/// HTTP GET against the control port.
pub struct HttpHealthCheck {
    client: reqwest::Client,
    host: String,
    path: String,
}

impl HttpHealthCheck {
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Fatal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            host: host.into(),
            path: path.into(),
        })
    }

    pub fn url_for(&self, ports: &PortSet) -> String {
        let path = self.path.trim_start_matches('/');
        format!("http://{}:{}/{}", self.host, ports.control, path)
    }
}

#[async_trait]
impl ReadinessCheck for HttpHealthCheck {
    async fn check(&self, name: &str, ports: &PortSet) -> Result<(), ProbeError> {
        let url = self.url_for(ports);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(ProbeError::NotReady(format!(
                "{} answered {} for {}",
                name,
                response.status(),
                url
            ))),
            // Connection refused, reset and timeouts all mean "still booting".
            Err(e) => Err(ProbeError::NotReady(format!("{}: {}", url, e))),
        }
    }
}

/// Grace period plus bounded polling of a [`ReadinessCheck`].
#[derive(Clone)]
pub struct ReadinessProber {
    check: Arc<dyn ReadinessCheck>,
    grace_period: Duration,
    policy: RetryPolicy,
}

impl ReadinessProber {
    pub fn new(check: Arc<dyn ReadinessCheck>, grace_period: Duration, policy: RetryPolicy) -> Self {
        Self {
            check,
            grace_period,
            policy,
        }
    }

    pub async fn wait_until_ready(&self, name: &str, ports: &PortSet) -> Result<(), FleetError> {
        tokio::time::sleep(self.grace_period).await;

        let check = &self.check;
        execute_counting(&self.policy, "readiness_probe", ProbeError::is_not_ready, || async move {
            check.check(name, ports).await
        })
        .await
        .map(|()| {
            tracing::info!(sandbox = %name, control_port = ports.control, "Sandbox is ready");
        })
        .map_err(|exhausted| FleetError::ReadinessTimeout {
            name: name.to_string(),
            attempts: exhausted.attempts,
            last_error: exhausted.error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Ready after a fixed number of failed checks.
    struct ReadyAfter {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReadinessCheck for ReadyAfter {
        async fn check(&self, _name: &str, _ports: &PortSet) -> Result<(), ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ProbeError::NotReady("booting".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Misconfigured;

    #[async_trait]
    impl ReadinessCheck for Misconfigured {
        async fn check(&self, _name: &str, _ports: &PortSet) -> Result<(), ProbeError> {
            Err(ProbeError::Fatal("bad url".to_string()))
        }
    }

    fn ports() -> PortSet {
        PortSet {
            display: 8006,
            control: 5000,
            browser_debug: 9222,
            media: 11000,
        }
    }

    #[tokio::test]
    async fn test_ready_after_retries() {
        let check = Arc::new(ReadyAfter {
            failures: 3,
            calls: AtomicU32::new(0),
        });
        let prober = ReadinessProber::new(check.clone(), Duration::ZERO, RetryPolicy::new(5, 0));
        prober.wait_until_ready("sb", &ports()).await.unwrap();
        assert_eq!(check.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhaustion_is_readiness_timeout() {
        let check = Arc::new(ReadyAfter {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let prober = ReadinessProber::new(check.clone(), Duration::ZERO, RetryPolicy::new(4, 0));
        let err = prober.wait_until_ready("sb", &ports()).await.unwrap_err();
        match err {
            FleetError::ReadinessTimeout { name, attempts, .. } => {
                assert_eq!(name, "sb");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected ReadinessTimeout, got {:?}", other),
        }
        assert_eq!(check.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_probe_error_is_not_retried() {
        let prober = ReadinessProber::new(Arc::new(Misconfigured), Duration::ZERO, RetryPolicy::new(5, 0));
        let err = prober.wait_until_ready("sb", &ports()).await.unwrap_err();
        assert!(matches!(err, FleetError::ReadinessTimeout { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_precedes_first_probe() {
        let check = Arc::new(ReadyAfter {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let prober = ReadinessProber::new(check, Duration::from_secs(3), RetryPolicy::new(1, 0));
        let started = tokio::time::Instant::now();
        prober.wait_until_ready("sb", &ports()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_health_url() {
        let check = HttpHealthCheck::new("127.0.0.1", "/screenshot", Duration::from_secs(10)).unwrap();
        assert_eq!(check.url_for(&ports()), "http://127.0.0.1:5000/screenshot");
    }

    #[tokio::test]
    async fn test_http_check_unreachable_is_not_ready() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let check = HttpHealthCheck::new("127.0.0.1", "/", Duration::from_secs(2)).unwrap();
        let mut ports = ports();
        ports.control = port;
        let err = check.check("sb", &ports).await.unwrap_err();
        assert!(err.is_not_ready());
    }
}
