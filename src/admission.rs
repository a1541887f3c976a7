//! Admission decisions for request handlers.
//!
//! Turns a limiter decision into something a handler can act on, and settles
//! what happens when the limiter cannot be reached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ratelimit::{Decision, Limiter, Policy};

/// What to do with a request while the limiter is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let the request through
    Open,
    /// Refuse the request
    Closed,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    /// Over quota; `retry_after` is whole seconds until `reset_at`, at least one
    Throttle {
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    },
    /// The limiter could not answer and the mode is [`FailureMode::Closed`]
    Unavailable,
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admit)
    }
}

/// Admission check in front of any [`Limiter`].
#[derive(Clone)]
pub struct Admission {
    limiter: Arc<dyn Limiter>,
    mode: FailureMode,
}

impl Admission {
    pub fn new(limiter: Arc<dyn Limiter>, mode: FailureMode) -> Self {
        Self { limiter, mode }
    }

    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    /// Decide whether `identity` may proceed under `policies`.
    ///
    /// Unavailability resolves according to the failure mode; any other
    /// error is returned to the caller.
    pub async fn admit(&self, identity: &str, policies: &[Policy]) -> Result<Verdict> {
        self.admit_at(identity, policies, Utc::now()).await
    }

    async fn admit_at(
        &self,
        identity: &str,
        policies: &[Policy],
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        match self.limiter.limit(identity, policies).await {
            Ok(Decision::Allow) => Ok(Verdict::Admit),
            Ok(Decision::Deny { reset_at }) => {
                let retry_after = retry_after(reset_at, now);
                debug!(identity = %identity, retry_after = ?retry_after, "Request throttled");
                Ok(Verdict::Throttle {
                    reset_at,
                    retry_after,
                })
            }
            Err(e) if e.is_unavailable() => {
                warn!(
                    identity = %identity,
                    error = %e,
                    mode = ?self.mode,
                    "Rate limiter unavailable"
                );
                Ok(match self.mode {
                    FailureMode::Open => Verdict::Admit,
                    FailureMode::Closed => Verdict::Unavailable,
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission").field("mode", &self.mode).finish()
    }
}

/// Whole seconds from `now` until `reset_at`, rounded up, never below one.
fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    Duration::from_secs(millis.div_ceil(1000).max(1))
}
