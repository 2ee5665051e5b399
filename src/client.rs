//! Single-host JSON-RPC device client: one shared `reqwest::Client` pool,
//! one operation (`call`), no retries — the scheduler owns retry policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::model::Credentials;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {host} timed out")]
    Timeout { host: String },
    #[error("failed to connect to {host}")]
    Connect { host: String },
    #[error("{host} rejected credentials (HTTP {status})")]
    AuthDenied { host: String, status: u16 },
    #[error("{host} returned HTTP {status}")]
    HttpStatus { host: String, status: u16 },
    #[error("malformed response from {host}: {reason}")]
    MalformedResponse { host: String, reason: String },
    #[error("{host} returned RPC error {code}: {message}")]
    RpcError { host: String, code: i64, message: String },
}

impl ClientError {
    /// A coarse tag used for "log at WARN on first occurrence, DEBUG on
    /// repeat" bookkeeping — two errors of the same kind against the same
    /// target are considered the same occurrence regardless of message text.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            ClientError::Timeout { .. } => "timeout",
            ClientError::Connect { .. } => "connect",
            ClientError::AuthDenied { .. } => "auth_denied",
            ClientError::HttpStatus { .. } => "http_status",
            ClientError::MalformedResponse { .. } => "malformed_response",
            ClientError::RpcError { .. } => "rpc_error",
        }
    }
}

/// A single-host JSON-RPC device client. Cheap to clone: internally holds
/// one shared, keepalive-enabled `reqwest::Client` reused across every
/// target, matching `neomind-devices::HttpAdapter`'s single-pool-per-adapter
/// design.
#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    next_id: std::sync::Arc<AtomicU64>,
}

impl DeviceClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("reqwest client construction with default TLS backend cannot fail");
        Self {
            http,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    /// Issue one JSON-RPC call to `http://{host}/rpc`. Applies HTTP Basic
    /// auth iff `auth` holds a non-empty username or password.
    pub async fn call(
        &self,
        host: &str,
        method: &str,
        auth: &Credentials,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({ "id": id, "method": method });
        let url = format!("http://{host}/rpc");

        let mut request = self.http.post(&url).timeout(timeout).json(&body);
        if !auth.is_empty() {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ClientError::Timeout { host: host.to_string() }
            } else {
                ClientError::Connect { host: host.to_string() }
            }
        })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ClientError::AuthDenied {
                host: host.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ClientError::HttpStatus {
                host: host.to_string(),
                status: status.as_u16(),
            });
        }

        let payload: Value = response.json().await.map_err(|err| ClientError::MalformedResponse {
            host: host.to_string(),
            reason: err.to_string(),
        })?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown RPC error")
                .to_string();
            return Err(ClientError::RpcError {
                host: host.to_string(),
                code,
                message,
            });
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ClientError::MalformedResponse {
                host: host.to_string(),
                reason: "response missing `result`".to_string(),
            })
    }
}

impl Default for DeviceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn spawn_mock(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn call_returns_result_on_success() {
        let app = Router::new().route(
            "/rpc",
            post(|| async { axum::Json(serde_json::json!({"result": {"model": "SPSW-104PE16EU"}})) }),
        );
        let addr = spawn_mock(app).await;
        let client = DeviceClient::new();
        let result = client
            .call(&addr.to_string(), "Shelly.GetDeviceInfo", &Credentials::default(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result["model"], "SPSW-104PE16EU");
    }

    #[tokio::test]
    async fn call_classifies_rpc_error() {
        let app = Router::new().route(
            "/rpc",
            post(|| async { axum::Json(serde_json::json!({"error": {"code": 404, "message": "not found"}})) }),
        );
        let addr = spawn_mock(app).await;
        let client = DeviceClient::new();
        let err = client
            .call(&addr.to_string(), "Shelly.GetStatus", &Credentials::default(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RpcError { code: 404, .. }));
    }

    #[tokio::test]
    async fn call_classifies_auth_denied() {
        let app = Router::new().route("/rpc", post(|| async { axum::http::StatusCode::UNAUTHORIZED }));
        let addr = spawn_mock(app).await;
        let client = DeviceClient::new();
        let err = client
            .call(&addr.to_string(), "Shelly.GetStatus", &Credentials::default(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AuthDenied { status: 401, .. }));
    }
}
