//! Retry policy and failure supervision

use std::time::Duration;

use log::debug;
use rand::Rng;

use super::config::{EscalationConfig, EscalationPolicy};
use crate::api::error::{FailureClass, RpcError};

/// Backoff parameters for a single remote call
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter on top of each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fewer, slower retries
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Computes backoff delays
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// `min(base * multiplier^attempt, cap)` plus optional jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let exp = self.config.backoff_multiplier.powi(attempt as i32);
        let capped_ms = (base_ms * exp).min(self.config.max_delay.as_millis() as f64);
        let mut delay = Duration::from_millis(capped_ms.max(0.0).round() as u64);

        if self.config.jitter && !delay.is_zero() {
            let max_jitter_ms = (delay.as_millis() as u64 / 10).max(1);
            let jitter_ms = rand::rng().random_range(0..=max_jitter_ms);
            delay += Duration::from_millis(jitter_ms);
        }

        delay
    }
}

/// What the session should do after a failed call
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep, then try the same call again
    Retry { delay: Duration },
    /// Too many consecutive failures: pause for the cool-down, reconnect, retry
    Cooldown(Duration),
    /// Attempts for this call are spent; report the call as failed
    GiveUp,
    /// Stop the job
    Abort,
    /// Not a retryable error; hand it to the caller unchanged
    Propagate,
}

/// Tracks consecutive failures across all calls of one job.
///
/// The counter resets on any successful call. When it passes the escalation
/// threshold the supervisor asks for a cool-down, and after
/// `max_cooldowns` cool-downs without recovery it asks to abort.
#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    policy: RetryPolicy,
    escalation: EscalationConfig,
    consecutive_failures: u32,
    cooldowns_used: u32,
    retries: u64,
}

impl RetrySupervisor {
    pub fn new(retry: RetryConfig, escalation: EscalationConfig) -> Self {
        Self {
            policy: RetryPolicy::new(retry),
            escalation,
            consecutive_failures: 0,
            cooldowns_used: 0,
            retries: 0,
        }
    }

    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                "Remote call succeeded after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.cooldowns_used = 0;
    }

    /// Decide how to continue after `error` on the given zero-based attempt
    pub fn on_failure(&mut self, error: &RpcError, attempt: u32) -> RetryDecision {
        if error.class() != FailureClass::Transient {
            return RetryDecision::Propagate;
        }
        // Exhausted calls were already counted attempt by attempt
        if matches!(error, RpcError::RetriesExhausted { .. }) {
            return RetryDecision::Propagate;
        }

        self.consecutive_failures += 1;

        if self.consecutive_failures > self.escalation.threshold {
            return match self.escalation.policy {
                EscalationPolicy::CooldownAndRetry
                    if self.cooldowns_used < self.escalation.max_cooldowns =>
                {
                    self.cooldowns_used += 1;
                    self.consecutive_failures = 0;
                    RetryDecision::Cooldown(self.escalation.cooldown)
                }
                _ => RetryDecision::Abort,
            };
        }

        if attempt + 1 < self.policy.max_attempts() {
            self.retries += 1;
            RetryDecision::Retry {
                delay: self.policy.delay_for(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Number of retries scheduled so far
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }
}
