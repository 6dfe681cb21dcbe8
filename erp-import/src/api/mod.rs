//! ERP remote API
//!
//! XML-RPC transport, failure classification, retry supervision and the
//! typed calls the import engine needs (search, read, create, write,
//! actions and field probing).

pub mod client;
pub mod error;
#[cfg(test)]
pub mod fake;
pub mod metadata;
pub mod operations;
pub mod query;
pub mod resilience;
pub mod session;
pub mod xmlrpc;

pub use client::{Credentials, ErpClient};
pub use resilience::ResilienceConfig;
pub use session::Session;
