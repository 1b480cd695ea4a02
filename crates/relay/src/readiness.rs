//! Readiness detection for encoder output.
//!
//! The encoder gives no signal when its first playlist is written, so the
//! playlist path is polled until it exists. The wait is bounded and can be
//! cancelled so shutdown does not hang on sessions that never come up.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Why a readiness wait ended without the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("timed out after {:?} waiting for playlist", .0)]
    Timeout(Duration),

    #[error("readiness wait cancelled")]
    Cancelled,
}

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl ReadinessPolicy {
    pub fn from_config(cfg: &hls_relay_config::ReadinessConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(500),
        }
    }
}

/// Wait for `manifest` to exist.
///
/// Checks immediately, then once per poll interval. Returns as soon as the
/// file is seen, `Timeout` once the overall budget is spent, or `Cancelled`
/// when `cancel` fires. Errors other than "not found" while probing count as
/// "not there yet". Budgets too large to express as a deadline never expire.
pub async fn wait_for_manifest(
    manifest: &Path,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<(), ReadinessError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReadinessError::Cancelled),
        found = timeout(policy.timeout, poll_until_present(manifest, policy.poll_interval)) => {
            found.map_err(|_| ReadinessError::Timeout(policy.timeout))
        }
    }
}

async fn poll_until_present(manifest: &Path, every: Duration) {
    loop {
        if tokio::fs::try_exists(manifest).await.unwrap_or(false) {
            return;
        }
        sleep(every).await;
    }
}
