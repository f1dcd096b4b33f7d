//! Caller-facing facade over the rate limiter.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::ratelimit::{Clock, RateLimiter, SystemClock};

/// What feature code gets back from a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl GuardResponse {
    fn allowed() -> Self {
        Self {
            success: true,
            message: None,
            retry_after_seconds: None,
        }
    }

    fn denied(retry_after_ms: u64) -> Self {
        let seconds = retry_after_ms.div_ceil(1000);
        let unit = if seconds == 1 { "second" } else { "seconds" };
        Self {
            success: false,
            message: Some(format!(
                "Too many requests. Please try again in {} {}.",
                seconds, unit
            )),
            retry_after_seconds: Some(seconds),
        }
    }
}

/// The single entry point intended for feature code.
pub struct RateLimitGuard<C: Clock = SystemClock> {
    rate_limiter: Arc<RateLimiter<C>>,
}

impl<C: Clock> RateLimitGuard<C> {
    pub fn new(rate_limiter: Arc<RateLimiter<C>>) -> Self {
        Self { rate_limiter }
    }

    /// Check `identifier` against the named operation's policy at the
    /// current time.
    ///
    /// Unknown operations are an error, never an implicit allow.
    pub fn check_rate_limit(&self, identifier: &str, operation: &str) -> Result<GuardResponse> {
        let decision = self.rate_limiter.check_limit(identifier, operation, None)?;
        if decision.allowed {
            return Ok(GuardResponse::allowed());
        }

        debug!(
            operation = %operation,
            identifier = %identifier,
            retry_after_ms = ?decision.retry_after_ms,
            "Rejecting rate limited request"
        );
        Ok(GuardResponse::denied(decision.retry_after_ms.unwrap_or(0)))
    }

    /// The limiter behind this guard.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter<C>> {
        &self.rate_limiter
    }
}

impl<C: Clock> Clone for RateLimitGuard<C> {
    fn clone(&self) -> Self {
        Self {
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}
