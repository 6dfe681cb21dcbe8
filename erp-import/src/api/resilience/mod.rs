//! Resilience for remote calls
//!
//! Retry policies with exponential backoff, the consecutive-failure
//! supervisor that escalates to cool-downs, and their configuration.

pub mod config;
pub mod retry;

pub use config::{EscalationPolicy, ResilienceConfig};
pub use retry::{RetryDecision, RetrySupervisor};
