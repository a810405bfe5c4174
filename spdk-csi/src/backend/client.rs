//! HTTP transports for the storage management APIs.
//!
//! [`JsonRpcClient`] speaks SPDK JSON-RPC 2.0; [`RestClient`] speaks the
//! cluster REST API with its `{"error": .., "result": ..}` envelope. Both
//! classify backend error messages into [`CsiError`] variants.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{CsiError, Result};
use crate::metrics;

/// Timeout applied to every management call.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(20);

const USER_AGENT: &str = concat!("spdk-csi/", env!("CARGO_PKG_VERSION"));

/// Map a backend error message to an error class.
pub fn classify(message: &str) -> CsiError {
    let lower = message.to_lowercase();
    if lower.contains("no space left") {
        CsiError::NoSpace(message.to_string())
    } else if lower.contains("no such device") || lower.contains("not found") {
        CsiError::NotFound(message.to_string())
    } else if lower.contains("already exists") || lower.contains("file exists") {
        CsiError::AlreadyExists(message.to_string())
    } else {
        CsiError::Backend(message.to_string())
    }
}

/// True for the SPDK "Invalid parameters" reply, which several query
/// methods return for an object that does not exist.
pub fn is_invalid_parameters(err: &CsiError) -> bool {
    matches!(err, CsiError::Backend(msg) if msg.to_lowercase().contains("invalid parameters"))
}

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(RPC_TIMEOUT)
        .build()
        .map_err(|e| CsiError::Internal(format!("failed to build HTTP client: {}", e)))
}

/// A JSON-RPC method invoker.
#[async_trait]
pub trait RpcCaller: Send + Sync {
    /// Invoke `method`; `Value::Null` params are omitted from the request.
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// Invoke `method` and decode its result.
pub async fn call_typed<T: DeserializeOwned>(
    caller: &dyn RpcCaller,
    method: &str,
    params: Value,
) -> Result<T> {
    let value = caller.call(method, params).await?;
    serde_json::from_value(value).map_err(|e| {
        CsiError::Backend(format!("unexpected result for {}: {}", method, e))
    })
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    result: Value,
}

/// SPDK JSON-RPC 2.0 over HTTP with basic auth.
pub struct JsonRpcClient {
    endpoint: String,
    url: String,
    username: String,
    password: String,
    http: Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(endpoint: &str, url: &str, username: &str, password: &str) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.to_string(),
            url: url.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http: http_client()?,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if !params.is_null() {
            body["params"] = params;
        }

        debug!(endpoint = %self.endpoint, method, id, "JSON-RPC request");

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(http_error(status, &text));
        }

        let reply: RpcResponse = response.json().await?;
        if reply.id != id {
            return Err(CsiError::Backend(format!(
                "{}: response id {} does not match request id {}",
                method, reply.id, id
            )));
        }
        match reply.error {
            Some(err) if err.code != 0 => {
                return Err(classify(&format!("{}: {}", method, err.message)));
            }
            _ => {}
        }
        Ok(reply.result)
    }
}

#[async_trait]
impl RpcCaller for JsonRpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let result = self.send(method, params).await;
        metrics::record_backend_request(&self.endpoint, result.is_ok());
        if let Err(e) = &result {
            debug!(endpoint = %self.endpoint, method, error = %e, "JSON-RPC call failed");
        }
        result
    }
}

fn http_error(status: StatusCode, body: &str) -> CsiError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::NOT_FOUND => CsiError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CsiError::Timeout(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => CsiError::Transport(message),
        _ => classify(&message),
    }
}

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    result: Value,
}

/// Cluster REST API client. Credentials travel in the `Authorization`
/// header as `"{username} {password}"`.
pub struct RestClient {
    endpoint: String,
    url: String,
    authorization: String,
    http: Client,
}

impl RestClient {
    pub fn new(endpoint: &str, url: &str, username: &str, password: &str) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.to_string(),
            url: url.trim_end_matches('/').to_string(),
            authorization: format!("{} {}", username, password),
            http: http_client()?,
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}/{}", self.url, path);
        debug!(endpoint = %self.endpoint, %method, %url, "REST request");

        let response = self
            .http
            .request(method, &url)
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(&body.unwrap_or_else(|| json!({})))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(http_error(status, &text));
        }

        let envelope: RestEnvelope = response.json().await?;
        match envelope.error {
            Some(err) if err.code != 0 => {
                return Err(classify(&format!("{}: {}", path, err.message)));
            }
            _ => {}
        }
        Ok(envelope.result)
    }
}

/// A REST API invoker returning the envelope's `result`.
#[async_trait]
pub trait RestCaller: Send + Sync {
    fn url(&self) -> &str;

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value>;
}

/// Issue `method path` and decode its result.
pub async fn request_typed<T: DeserializeOwned>(
    caller: &dyn RestCaller,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> Result<T> {
    let value = caller.request(method, path, body).await?;
    serde_json::from_value(value)
        .map_err(|e| CsiError::Backend(format!("unexpected result for {}: {}", path, e)))
}

#[async_trait]
impl RestCaller for RestClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let result = self.send(method, path, body).await;
        metrics::record_backend_request(&self.endpoint, result.is_ok());
        if let Err(e) = &result {
            debug!(endpoint = %self.endpoint, path, error = %e, "REST call failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify("bdev_lvol_create: No space left on device"),
            CsiError::NoSpace(_)
        ));
        assert!(matches!(
            classify("bdev_get_bdevs: No such device"),
            CsiError::NotFound(_)
        ));
        assert!(matches!(classify("Lvol not found"), CsiError::NotFound(_)));
        assert!(matches!(
            classify("nvmf_create_transport: Transport type 'TCP' already exists"),
            CsiError::AlreadyExists(_)
        ));
        assert!(matches!(classify("Internal error"), CsiError::Backend(_)));
    }

    #[test]
    fn test_is_invalid_parameters() {
        assert!(is_invalid_parameters(&classify("nvmf_get_subsystems: Invalid parameters")));
        assert!(!is_invalid_parameters(&classify("No such device")));
    }

    #[test]
    fn test_http_error_mapping() {
        assert!(matches!(
            http_error(StatusCode::NOT_FOUND, "missing"),
            CsiError::NotFound(_)
        ));
        assert!(matches!(
            http_error(StatusCode::SERVICE_UNAVAILABLE, ""),
            CsiError::Transport(_)
        ));
        assert!(matches!(
            http_error(StatusCode::GATEWAY_TIMEOUT, ""),
            CsiError::Timeout(_)
        ));
        assert!(matches!(
            http_error(StatusCode::INTERNAL_SERVER_ERROR, "No space left"),
            CsiError::NoSpace(_)
        ));
    }

    #[test]
    fn test_rpc_response_decoding() {
        let ok: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":true}"#).unwrap();
        assert_eq!(ok.id, 7);
        assert!(ok.error.is_none());
        assert_eq!(ok.result, Value::Bool(true));

        let err: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":8,"error":{"code":-32602,"message":"Invalid parameters"}}"#,
        )
        .unwrap();
        assert_eq!(err.error.unwrap().code, -32602);
        assert!(err.result.is_null());
    }

    #[test]
    fn test_rest_url_normalized() {
        let client = RestClient::new("c1", "http://10.0.0.1:8080/", "id", "secret").unwrap();
        assert_eq!(client.url(), "http://10.0.0.1:8080");
        assert_eq!(client.authorization, "id secret");
    }
}
