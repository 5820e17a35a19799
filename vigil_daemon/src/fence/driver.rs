//! The STONITH driver capability interface and the retry policy shared by
//! its implementations.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::DriverConfig;
use crate::p2p::client::FetchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("driver endpoint unreachable: {0}")]
    Unreachable(#[from] FetchError),
    #[error("driver rejected the request: HTTP {status} {detail}")]
    Rejected { status: u16, detail: String },
    #[error("driver returned an unparseable reply: {0}")]
    BadReply(String),
    #[error("no such target {0:?}")]
    UnknownTarget(String),
}

/// Capability set every fencing backend provides. Targets are the
/// node-mapping values from the configuration, not cluster node names.
#[async_trait]
pub trait StonithDriver: Send + Sync {
    /// Human-readable driver kind for status output.
    fn kind(&self) -> &'static str;

    /// Cheap connectivity check, run once at daemon start.
    async fn test(&self) -> Result<(), DriverError>;

    async fn status(&self, target: &str) -> Result<PowerState, DriverError>;

    async fn power_off(&self, target: &str) -> Result<(), DriverError>;

    async fn power_on(&self, target: &str) -> Result<(), DriverError>;

    /// Release any backend session state. Default: nothing to do.
    async fn destroy(&self) {}
}

/// Tagged-variant driver selection at startup.
pub fn build_driver(config: &DriverConfig) -> Box<dyn StonithDriver> {
    match config {
        DriverConfig::Hypervisor {
            api_url,
            token,
            retries,
            retry_delay_ms,
        } => Box::new(super::hypervisor::HypervisorDriver::new(
            api_url.clone(),
            token.clone(),
            RetryPolicy::new(*retries, Duration::from_millis(*retry_delay_ms)),
        )),
        DriverConfig::Http {
            power_off_url,
            power_on_url,
            status_url,
            method,
            retries,
            retry_delay_ms,
        } => Box::new(super::http_template::HttpTemplateDriver::new(
            power_off_url.clone(),
            power_on_url.clone(),
            status_url.clone(),
            method.clone().unwrap_or_else(|| "POST".to_string()),
            RetryPolicy::new(*retries, Duration::from_millis(*retry_delay_ms)),
        )),
    }
}

/// Exponential backoff: attempt N sleeps `delay * 2^(N-1)` before
/// retrying. The error of the final attempt is the one surfaced.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub async fn run<T, F, Fut>(&self, mut thunk: F) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DriverError>>,
    {
        let mut attempt = 1;
        loop {
            match thunk().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.attempts => return Err(error),
                Err(_) => {
                    let backoff = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_exponentially_then_surfaces_the_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DriverError::BadReply("still broken".to_string()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff between the three attempts.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn success_short_circuits() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
