//! Backoff schedule shared by the supervisor and the call gateway.

use std::time::Duration;

/// Default delays between attempts of one retry campaign.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

/// An ordered sequence of delays consumed left-to-right per campaign.
///
/// A policy with `k` delays allows `k + 1` attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays_ms: &[u64]) -> Self {
        Self::new(delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(Vec::new())
    }

    /// Fresh iterator over the delays for a new campaign.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.delays.iter().copied()
    }

    /// Total number of attempts a campaign may make.
    pub fn max_attempts(&self) -> u32 {
        self.delays.len() as u32 + 1
    }

    /// Sum of every delay; the minimum wall time of a fully failed campaign.
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_RETRY_DELAYS_MS)
    }
}
