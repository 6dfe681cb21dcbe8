//! XML-RPC client for the ERP's authentication and object endpoints

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;

use super::error::RpcError;
use super::xmlrpc::{Record, Response, RpcValue, decode_response, encode_call};

/// The remote boundary the engine talks to.
///
/// Implemented by [`ErpClient`] over HTTP; tests substitute an in-memory
/// server. Implementations are used from one task at a time.
#[async_trait]
pub trait ErpApi: Send {
    /// Perform the login handshake and return the principal identifier
    async fn authenticate(&mut self) -> Result<i64, RpcError>;

    /// Invoke `method` on `entity` with positional and named arguments
    async fn execute_kw(
        &mut self,
        entity: &str,
        method: &str,
        args: Vec<RpcValue>,
        kwargs: Record,
    ) -> Result<RpcValue, RpcError>;

    /// Server identification (no authentication required)
    async fn version(&mut self) -> Result<RpcValue, RpcError>;

    /// Forget the principal and release transport resources
    async fn close(&mut self);
}

/// Connection parameters for [`ErpClient`]
#[derive(Debug, Clone)]
pub struct Credentials {
    pub server_url: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// HTTP XML-RPC client
pub struct ErpClient {
    http: reqwest::Client,
    credentials: Credentials,
    uid: Option<i64>,
}

impl ErpClient {
    pub fn new(credentials: Credentials, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::InvalidEndpoint(e.to_string()))?;

        Ok(Self {
            http,
            credentials,
            uid: None,
        })
    }

    fn endpoint(&self, service: &str) -> String {
        format!(
            "{}/xmlrpc/2/{}",
            self.credentials.server_url.trim_end_matches('/'),
            service
        )
    }

    async fn post(
        &self,
        service: &str,
        method: &str,
        params: &[RpcValue],
    ) -> Result<RpcValue, RpcError> {
        let body = encode_call(method, params)
            .map_err(|e| RpcError::Malformed(format!("failed to encode request: {}", e)))?;
        let url = self.endpoint(service);

        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let snippet: String = text.chars().take(200).collect();
            return Err(RpcError::Http {
                status: status.as_u16(),
                message: snippet,
            });
        }

        match decode_response(&text)? {
            Response::Success(value) => Ok(value),
            Response::Fault { code, message } => Err(RpcError::Fault { code, message }),
        }
    }
}

#[async_trait]
impl ErpApi for ErpClient {
    async fn authenticate(&mut self) -> Result<i64, RpcError> {
        let params = [
            RpcValue::from(self.credentials.database.as_str()),
            RpcValue::from(self.credentials.username.as_str()),
            RpcValue::from(self.credentials.password.as_str()),
            RpcValue::Struct(Record::new()),
        ];

        let result = match self.post("common", "authenticate", &params).await {
            Ok(value) => value,
            // Faults here mean unknown database or a login refused outright
            Err(err @ RpcError::Fault { .. }) if !err.is_session_expired() => {
                return Err(RpcError::AuthFailure(err.summary()));
            }
            Err(err) => return Err(err),
        };

        match result {
            RpcValue::Int(uid) if uid > 0 => {
                info!(
                    "Authenticated as '{}' on database '{}' (uid {})",
                    self.credentials.username, self.credentials.database, uid
                );
                self.uid = Some(uid);
                Ok(uid)
            }
            _ => Err(RpcError::AuthFailure(format!(
                "credentials rejected for '{}' on database '{}'",
                self.credentials.username, self.credentials.database
            ))),
        }
    }

    async fn execute_kw(
        &mut self,
        entity: &str,
        method: &str,
        args: Vec<RpcValue>,
        kwargs: Record,
    ) -> Result<RpcValue, RpcError> {
        let uid = self
            .uid
            .ok_or_else(|| RpcError::AuthFailure("session is not authenticated".to_string()))?;

        debug!("execute_kw {}.{} ({} args)", entity, method, args.len());

        let params = [
            RpcValue::from(self.credentials.database.as_str()),
            RpcValue::Int(uid),
            RpcValue::from(self.credentials.password.as_str()),
            RpcValue::from(entity),
            RpcValue::from(method),
            RpcValue::Array(args),
            RpcValue::Struct(kwargs),
        ];

        self.post("object", "execute_kw", &params).await
    }

    async fn version(&mut self) -> Result<RpcValue, RpcError> {
        self.post("common", "version", &[]).await
    }

    async fn close(&mut self) {
        if self.uid.take().is_some() {
            debug!("Closed session for '{}'", self.credentials.username);
        }
    }
}
