//! Network probes for configured dependencies
//!
//! - `tcp`: a TCP connect to `host:port`
//! - `http`: a GET; 2xx is healthy, 5xx unhealthy, anything else degraded
//!
//! The health monitor wraps every probe in its own timeout. The timeouts
//! here only bound the underlying connect/request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use resilience_core::{DependencyConfig, HealthProbe, HealthStatus, ProbeKind, ProbeOutcome};

/// Connects to a TCP endpoint
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Probe `target` (`host:port`)
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> Result<ProbeOutcome> {
        let started = Instant::now();
        let connect = tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await;

        Ok(match connect {
            Ok(Ok(_stream)) => {
                debug!(target = %self.target, "TCP probe connected");
                ProbeOutcome::healthy()
                    .with_detail("target", self.target.clone())
                    .with_detail("connect_ms", elapsed_ms(started))
            }
            Ok(Err(e)) => ProbeOutcome::unhealthy(format!("connect to {} failed: {e}", self.target))
                .with_detail("target", self.target.clone()),
            Err(_) => ProbeOutcome::unhealthy(format!("connect to {} timed out", self.target))
                .with_detail("target", self.target.clone()),
        })
    }
}

/// Issues an HTTP GET
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Probe `url` with a request timeout
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, url: url.into() })
    }
}

/// Health implied by an HTTP status code
pub fn status_for(code: u16) -> HealthStatus {
    match code {
        200..=299 => HealthStatus::Healthy,
        500..=599 => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> Result<ProbeOutcome> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;

        let code = response.status().as_u16();
        let outcome = match status_for(code) {
            HealthStatus::Healthy => ProbeOutcome::healthy(),
            HealthStatus::Unhealthy => ProbeOutcome::unhealthy(format!("HTTP {code}")),
            _ => ProbeOutcome::degraded(format!("HTTP {code}")),
        };
        Ok(outcome
            .with_detail("url", self.url.clone())
            .with_detail("http_status", code)
            .with_detail("response_ms", elapsed_ms(started)))
    }
}

/// Probe for a configured dependency
///
/// # Errors
///
/// Fails if an HTTP client cannot be built.
pub fn build_probe(dep: &DependencyConfig, timeout: Duration) -> Result<Arc<dyn HealthProbe>> {
    Ok(match dep.probe {
        ProbeKind::Tcp => Arc::new(TcpProbe::new(dep.target.clone(), timeout)),
        ProbeKind::Http => Arc::new(HttpProbe::new(dep.target.clone(), timeout)?),
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response per connection
    async fn http_stub(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/health")
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(200), HealthStatus::Healthy);
        assert_eq!(status_for(204), HealthStatus::Healthy);
        assert_eq!(status_for(301), HealthStatus::Degraded);
        assert_eq!(status_for(429), HealthStatus::Degraded);
        assert_eq!(status_for(503), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let outcome = TcpProbe::new(addr.to_string(), Duration::from_secs(1)).check().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let outcome = TcpProbe::new(addr.to_string(), Duration::from_secs(1)).check().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert!(outcome.error.unwrap().contains("failed"));
    }

    #[tokio::test]
    async fn test_http_probe_maps_status() {
        let ok = http_stub("200 OK").await;
        let down = http_stub("503 Service Unavailable").await;
        let moved = http_stub("404 Not Found").await;

        let probe = |url: String| HttpProbe::new(url, Duration::from_secs(2)).unwrap();

        assert_eq!(probe(ok).check().await.unwrap().status, HealthStatus::Healthy);
        let outcome = probe(down).check().await.unwrap();
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert_eq!(outcome.details["http_status"], 503);
        assert_eq!(probe(moved).check().await.unwrap().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_build_probe_for_each_kind() {
        let tcp = DependencyConfig {
            name: "cache-service".into(),
            class: None,
            probe: ProbeKind::Tcp,
            target: "127.0.0.1:6379".into(),
        };
        let http = DependencyConfig {
            probe: ProbeKind::Http,
            target: "http://127.0.0.1:9/health".into(),
            ..tcp.clone()
        };
        assert!(build_probe(&tcp, Duration::from_secs(1)).is_ok());
        assert!(build_probe(&http, Duration::from_secs(1)).is_ok());
    }
}
