//! Supervised session over an [`ErpApi`]
//!
//! Every remote call made by the engine goes through [`Session::call`],
//! which applies the retry supervisor: backoff on transient failures,
//! liveness probe or re-authentication before retrying, cool-down after a
//! run of consecutive failures, and abort when the server stays away.

use log::{debug, info, warn};

use super::client::ErpApi;
use super::error::{FailureClass, RpcError};
use super::query::Domain;
use super::resilience::{ResilienceConfig, RetryDecision, RetrySupervisor};
use super::xmlrpc::{Record, RpcValue};

/// Entity used for the liveness probe; present on every installation
const PROBE_ENTITY: &str = "res.users";

/// An authenticated, supervised connection owned by one job
pub struct Session<A: ErpApi> {
    api: A,
    supervisor: RetrySupervisor,
    principal: Option<i64>,
    calls: u64,
    closed: bool,
}

impl<A: ErpApi> Session<A> {
    pub fn new(api: A, resilience: &ResilienceConfig) -> Self {
        Self {
            api,
            supervisor: RetrySupervisor::new(
                resilience.retry.clone(),
                resilience.escalation.clone(),
            ),
            principal: None,
            calls: 0,
            closed: false,
        }
    }

    /// Log in. Transient failures are retried like any other call.
    pub async fn authenticate(&mut self) -> Result<i64, RpcError> {
        let mut attempt = 0;
        loop {
            match self.api.authenticate().await {
                Ok(uid) => {
                    self.supervisor.record_success();
                    self.principal = Some(uid);
                    return Ok(uid);
                }
                Err(error) => match self.supervisor.on_failure(&error, attempt) {
                    RetryDecision::Retry { delay } => {
                        warn!("Authentication failed ({}); retrying in {:?}", error, delay);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::Cooldown(cooldown) => {
                        warn!("Server keeps failing; cooling down for {:?}", cooldown);
                        tokio::time::sleep(cooldown).await;
                        attempt = 0;
                    }
                    RetryDecision::GiveUp | RetryDecision::Abort => {
                        return Err(RpcError::Unreachable(format!(
                            "could not authenticate: {}",
                            error
                        )));
                    }
                    RetryDecision::Propagate => return Err(error),
                },
            }
        }
    }

    /// Re-acquire the principal after an expired session
    pub async fn reauthenticate(&mut self) -> Result<i64, RpcError> {
        info!("Re-authenticating");
        let uid = self.api.authenticate().await?;
        self.principal = Some(uid);
        Ok(uid)
    }

    /// Server identification
    pub async fn version(&mut self) -> Result<RpcValue, RpcError> {
        self.api.version().await
    }

    /// Cheap read used to validate the session before a retry
    pub async fn probe(&mut self) -> Result<(), RpcError> {
        let uid = self.principal.unwrap_or(0);
        let domain = Domain::new().eq("id", uid);
        self.api
            .execute_kw(PROBE_ENTITY, "search_count", vec![domain.to_rpc()], Record::new())
            .await
            .map(|_| ())
    }

    /// Make a supervised remote call
    pub async fn call(
        &mut self,
        entity: &str,
        method: &str,
        args: Vec<RpcValue>,
        kwargs: Record,
    ) -> Result<RpcValue, RpcError> {
        let mut attempt = 0;
        loop {
            self.calls += 1;
            let result = self
                .api
                .execute_kw(entity, method, args.clone(), kwargs.clone())
                .await;

            let error = match result {
                Ok(value) => {
                    self.supervisor.record_success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            match self.supervisor.on_failure(&error, attempt) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        "{}.{} failed ({}); retry {}/{} in {:?}",
                        entity,
                        method,
                        error,
                        attempt + 1,
                        self.supervisor.max_attempts() - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    self.recover(&error).await?;
                    attempt += 1;
                }
                RetryDecision::Cooldown(cooldown) => {
                    warn!(
                        "{}.{}: too many consecutive failures; cooling down for {:?}",
                        entity, method, cooldown
                    );
                    tokio::time::sleep(cooldown).await;
                    if let Err(e) = self.reauthenticate().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        debug!("Reconnect after cool-down failed: {}", e);
                    }
                    attempt = 0;
                }
                RetryDecision::GiveUp => {
                    return Err(RpcError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(error),
                    });
                }
                RetryDecision::Abort => {
                    return Err(RpcError::Unreachable(format!(
                        "{} consecutive failures, last on {}.{}: {}",
                        self.supervisor.consecutive_failures(),
                        entity,
                        method,
                        error
                    )));
                }
                RetryDecision::Propagate => return Err(error),
            }
        }
    }

    /// Get the session back into a usable state before a retry
    async fn recover(&mut self, error: &RpcError) -> Result<(), RpcError> {
        if error.is_session_expired() {
            return match self.reauthenticate().await {
                Err(e) if e.is_fatal() => Err(e),
                _ => Ok(()),
            };
        }

        match self.probe().await {
            Ok(()) => Ok(()),
            Err(probe_err) if probe_err.is_session_expired() => match self.reauthenticate().await {
                Err(e) if e.is_fatal() => Err(e),
                _ => Ok(()),
            },
            Err(probe_err) if probe_err.class() == FailureClass::Transient => {
                debug!("Liveness probe failed: {}", probe_err);
                Ok(())
            }
            Err(probe_err) if probe_err.is_fatal() => Err(probe_err),
            Err(probe_err) => {
                // The probe itself was refused; the principal is likely stale
                debug!("Liveness probe rejected ({}); re-authenticating", probe_err);
                match self.reauthenticate().await {
                    Err(e) if e.is_fatal() => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }

    pub async fn search(
        &mut self,
        entity: &str,
        domain: &Domain,
        limit: Option<usize>,
    ) -> Result<Vec<i64>, RpcError> {
        let mut kwargs = Record::new();
        if let Some(limit) = limit {
            kwargs.insert("limit".to_string(), RpcValue::from(limit));
        }
        kwargs.insert("order".to_string(), RpcValue::from("id asc"));
        let result = self.call(entity, "search", vec![domain.to_rpc()], kwargs).await?;
        Ok(result.ids())
    }

    pub async fn search_read(
        &mut self,
        entity: &str,
        domain: &Domain,
        fields: &[&str],
        limit: Option<usize>,
    ) -> Result<Vec<Record>, RpcError> {
        let mut kwargs = Record::new();
        kwargs.insert("fields".to_string(), fields_arg(fields));
        kwargs.insert("order".to_string(), RpcValue::from("id asc"));
        if let Some(limit) = limit {
            kwargs.insert("limit".to_string(), RpcValue::from(limit));
        }
        let result = self
            .call(entity, "search_read", vec![domain.to_rpc()], kwargs)
            .await?;
        Ok(result.records())
    }

    pub async fn search_count(&mut self, entity: &str, domain: &Domain) -> Result<i64, RpcError> {
        let result = self
            .call(entity, "search_count", vec![domain.to_rpc()], Record::new())
            .await?;
        result
            .as_i64()
            .ok_or_else(|| RpcError::Malformed(format!("search_count returned {}", result)))
    }

    pub async fn read(
        &mut self,
        entity: &str,
        ids: &[i64],
        fields: &[&str],
    ) -> Result<Vec<Record>, RpcError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut kwargs = Record::new();
        kwargs.insert("fields".to_string(), fields_arg(fields));
        let result = self
            .call(entity, "read", vec![RpcValue::from(ids.to_vec())], kwargs)
            .await?;
        Ok(result.records())
    }

    pub async fn create(&mut self, entity: &str, values: Record) -> Result<i64, RpcError> {
        let result = self
            .call(entity, "create", vec![RpcValue::Struct(values)], Record::new())
            .await?;
        // Newer servers answer a list of ids even for a single record
        result
            .relation_id()
            .ok_or_else(|| RpcError::Malformed(format!("create returned {}", result)))
    }

    pub async fn write(
        &mut self,
        entity: &str,
        ids: &[i64],
        values: Record,
    ) -> Result<(), RpcError> {
        self.call(
            entity,
            "write",
            vec![RpcValue::from(ids.to_vec()), RpcValue::Struct(values)],
            Record::new(),
        )
        .await
        .map(|_| ())
    }

    /// Field names exposed by `entity`
    pub async fn fields_get(&mut self, entity: &str) -> Result<Vec<String>, RpcError> {
        let mut kwargs = Record::new();
        kwargs.insert(
            "attributes".to_string(),
            RpcValue::from(vec!["type".to_string()]),
        );
        let result = self.call(entity, "fields_get", vec![], kwargs).await?;
        let fields = result.as_struct().ok_or_else(|| {
            RpcError::Malformed(format!("fields_get on {} returned {}", entity, result))
        })?;
        Ok(fields.keys().cloned().collect())
    }

    /// Invoke a state-transition action such as `action_post`
    pub async fn action(
        &mut self,
        entity: &str,
        method: &str,
        ids: &[i64],
    ) -> Result<RpcValue, RpcError> {
        self.call(entity, method, vec![RpcValue::from(ids.to_vec())], Record::new())
            .await
    }

    /// Number of remote calls issued, retries included
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn retries(&self) -> u64 {
        self.supervisor.retries()
    }

    /// Release the session
    pub async fn close(&mut self) {
        if !self.closed {
            self.api.close().await;
            self.principal = None;
            self.closed = true;
            debug!("Session closed after {} calls", self.calls);
        }
    }
}

impl<A: ErpApi> Drop for Session<A> {
    fn drop(&mut self) {
        if !self.closed {
            // The transport is released with `api`; only the principal leaks
            debug!("Session dropped without close() after {} calls", self.calls);
        }
    }
}

fn fields_arg(fields: &[&str]) -> RpcValue {
    RpcValue::Array(fields.iter().map(|f| RpcValue::from(*f)).collect())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::fake::FakeErp;
    use crate::api::resilience::EscalationPolicy;

    fn instant(attempts: u32) -> ResilienceConfig {
        ResilienceConfig::builder()
            .max_attempts(attempts)
            .base_delay(Duration::ZERO)
            .max_delay(Duration::ZERO)
            .jitter(false)
            .cooldown(Duration::ZERO)
            .build()
    }

    fn network() -> RpcError {
        RpcError::Network("connection reset".to_string())
    }

    async fn session(fake: &FakeErp, config: &ResilienceConfig) -> Session<FakeErp> {
        let mut session = Session::new(fake.clone(), config);
        session.authenticate().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fake = FakeErp::new();
        fake.seed("res.partner", &[("name", RpcValue::from("Acme"))]);
        fake.fail_next(Some("search"), network())
            .fail_next(Some("search"), network());

        let mut session = session(&fake, &instant(3)).await;
        let ids = session
            .search("res.partner", &Domain::new().eq("name", "Acme"), None)
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        assert_eq!(session.retries(), 2);
        assert_eq!(fake.calls_to("search"), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let fake = FakeErp::new();
        for _ in 0..3 {
            fake.fail_next(Some("search"), network());
        }

        let mut session = session(&fake, &instant(3)).await;
        let err = session
            .search("res.partner", &Domain::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[tokio::test]
    async fn test_semantic_fault_is_not_retried() {
        let fake = FakeErp::new();
        fake.fail_next(
            Some("create"),
            RpcError::Fault {
                code: "1".to_string(),
                message: "ValidationError: missing partner".to_string(),
            },
        );

        let mut session = session(&fake, &instant(3)).await;
        let err = session.create("account.move", Record::new()).await.unwrap_err();

        assert_eq!(err.class(), FailureClass::Semantic);
        assert_eq!(session.retries(), 0);
        assert_eq!(fake.calls_to("create"), 1);
    }

    #[tokio::test]
    async fn test_expired_session_reauthenticates() {
        let fake = FakeErp::new();
        fake.fail_next(
            Some("search_count"),
            RpcError::Fault {
                code: "100".to_string(),
                message: "Session expired".to_string(),
            },
        );

        let mut session = session(&fake, &instant(3)).await;
        let count = session
            .search_count("res.partner", &Domain::new())
            .await
            .unwrap();

        assert_eq!(count, 0);
        assert_eq!(fake.logins(), 2);
    }

    #[tokio::test]
    async fn test_escalation_aborts_when_cooldowns_are_spent() {
        let fake = FakeErp::new();
        for _ in 0..5 {
            fake.fail_next(Some("search"), network());
        }
        let config = ResilienceConfig::builder()
            .retry_config(instant(5).retry)
            .escalation_threshold(2)
            .max_cooldowns(0)
            .cooldown(Duration::ZERO)
            .escalation_policy(EscalationPolicy::CooldownAndRetry)
            .build();

        let mut session = session(&fake, &config).await;
        let err = session
            .search("res.partner", &Domain::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Unreachable(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_cooldown_then_recovery() {
        let fake = FakeErp::new();
        for _ in 0..3 {
            fake.fail_next(Some("search"), network());
        }
        let config = ResilienceConfig::builder()
            .retry_config(instant(5).retry)
            .escalation_threshold(2)
            .max_cooldowns(1)
            .cooldown(Duration::ZERO)
            .build();

        let mut session = session(&fake, &config).await;
        let ids = session
            .search("res.partner", &Domain::new(), None)
            .await
            .unwrap();

        assert!(ids.is_empty());
        // Cool-down reconnects once
        assert_eq!(fake.logins(), 2);
    }

    #[tokio::test]
    async fn test_rejected_login_is_fatal() {
        let fake = FakeErp::new();
        fake.reject_login();

        let mut session = Session::new(fake, &instant(3));
        let err = session.authenticate().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
