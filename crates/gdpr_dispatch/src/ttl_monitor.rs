#![forbid(unsafe_code)]

use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TtlPolicy;
use crate::error::DispatchError;

/// Source of the current number of live (unexpired, untombstoned) records.
pub trait LiveCountOracle: Send + Sync {
    fn live_count(&self) -> Result<u64, DispatchError>;
}

impl<F> LiveCountOracle for F
where
    F: Fn() -> Result<u64, DispatchError> + Send + Sync,
{
    fn live_count(&self) -> Result<u64, DispatchError> {
        self()
    }
}

#[derive(Debug, Deserialize)]
struct CountReply {
    count: u64,
}

/// Reads `{"count": n}` from an HTTP endpoint.
#[derive(Debug)]
pub struct HttpLiveCountOracle {
    url: String,
    agent: ureq::Agent,
}

impl HttpLiveCountOracle {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout_read(timeout)
                .build(),
        }
    }
}

impl LiveCountOracle for HttpLiveCountOracle {
    fn live_count(&self) -> Result<u64, DispatchError> {
        let unavailable = |reason: String| {
            DispatchError::Execution {
                shard_index: 0,
                source: gdpr_storage::StorageError::Unavailable {
                    endpoint: self.url.clone(),
                    reason,
                },
            }
        };
        match self.agent.get(&self.url).call() {
            Ok(resp) => {
                let text = resp
                    .into_string()
                    .map_err(|e| unavailable(format!("read failed: {e}")))?;
                serde_json::from_str::<CountReply>(&text)
                    .map(|r| r.count)
                    .map_err(|e| unavailable(format!("decode failed: {e}")))
            }
            Err(ureq::Error::Status(code, _)) => Err(unavailable(format!("http {code}"))),
            Err(ureq::Error::Transport(err)) => Err(unavailable(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    Converged { polls: u32, observed: u64 },
    TimedOut { polls: u32, last_observed: Option<u64> },
}

impl ConvergenceOutcome {
    pub fn polls(&self) -> u32 {
        match self {
            ConvergenceOutcome::Converged { polls, .. }
            | ConvergenceOutcome::TimedOut { polls, .. } => *polls,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceOutcome::Converged { .. })
    }
}

/// Blocks until the live count falls to the expected value. Polls at a fixed
/// interval; an oracle error counts as one non-convergent poll.
#[derive(Debug, Clone)]
pub struct TtlExpiryMonitor {
    policy: TtlPolicy,
}

impl TtlExpiryMonitor {
    pub fn new(policy: TtlPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    pub fn await_convergence(
        &self,
        oracle: &dyn LiveCountOracle,
        expected: u64,
    ) -> ConvergenceOutcome {
        let started = Instant::now();
        let mut polls = 0u32;
        let mut last_observed = None;
        loop {
            polls = polls.saturating_add(1);
            match oracle.live_count() {
                Ok(observed) if observed <= expected => {
                    debug!(observed, expected, polls, "ttl expiry converged");
                    return ConvergenceOutcome::Converged { polls, observed };
                }
                Ok(observed) => {
                    debug!(observed, expected, polls, "ttl expiry pending");
                    last_observed = Some(observed);
                }
                Err(err) => warn!(error = %err, polls, "live count poll failed"),
            }
            if let Some(max_wait) = self.policy.max_wait {
                if started.elapsed() + self.policy.poll_interval > max_wait {
                    warn!(expected, polls, ?last_observed, "ttl expiry wait timed out");
                    return ConvergenceOutcome::TimedOut {
                        polls,
                        last_observed,
                    };
                }
            }
            thread::sleep(self.policy.poll_interval);
        }
    }
}
