//! Resilience configuration with builder pattern
//!
//! Bundles the per-call retry policy, the escalation rules for runs of
//! consecutive failures, and the HTTP timeout, with sane defaults.

use super::retry::RetryConfig;
use std::time::Duration;

/// Global resilience configuration for remote calls
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub escalation: EscalationConfig,
    /// Timeout for a single HTTP request
    pub request_timeout: Duration,
}

/// What to do once consecutive failures pass the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationPolicy {
    /// Sleep for the cool-down, reconnect and keep going
    CooldownAndRetry,
    /// Stop the job right away
    Abort,
}

/// Escalation rules for runs of consecutive transient failures
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Consecutive failures tolerated before escalating
    pub threshold: u32,
    /// Pause before reconnecting after an escalation
    pub cooldown: Duration,
    /// Cool-downs allowed without an intervening success before aborting
    pub max_cooldowns: u32,
    pub policy: EscalationPolicy,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldowns: 3,
            policy: EscalationPolicy::CooldownAndRetry,
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            escalation: EscalationConfig::default(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ResilienceConfig {
    /// Create a new builder for ResilienceConfig
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::new()
    }

    /// Conservative config for servers that are known to be fragile
    pub fn conservative() -> Self {
        Self {
            retry: RetryConfig::conservative(),
            escalation: EscalationConfig {
                threshold: 3,
                cooldown: Duration::from_secs(120),
                max_cooldowns: 5,
                policy: EscalationPolicy::CooldownAndRetry,
            },
            request_timeout: Duration::from_secs(300),
        }
    }

    /// No retries, no waiting (for testing)
    pub fn disabled() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_millis(0),
                max_delay: Duration::from_millis(0),
                backoff_multiplier: 1.0,
                jitter: false,
            },
            escalation: EscalationConfig {
                threshold: u32::MAX,
                cooldown: Duration::from_millis(0),
                max_cooldowns: 0,
                policy: EscalationPolicy::Abort,
            },
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Builder for ResilienceConfig
#[derive(Debug)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
        }
    }

    /// Configure retry behavior
    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the number of attempts per call
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.retry.jitter = enabled;
        self
    }

    /// Set consecutive failures tolerated before escalating
    pub fn escalation_threshold(mut self, threshold: u32) -> Self {
        self.config.escalation.threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.escalation.cooldown = cooldown;
        self
    }

    pub fn max_cooldowns(mut self, max: u32) -> Self {
        self.config.escalation.max_cooldowns = max;
        self
    }

    pub fn escalation_policy(mut self, policy: EscalationPolicy) -> Self {
        self.config.escalation.policy = policy;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ResilienceConfig {
        self.config
    }
}

impl Default for ResilienceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
