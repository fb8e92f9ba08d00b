//! Transport layer for JSON-RPC communication

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

use crate::{RpcError, RpcResult};

/// Transport trait for RPC communication (object-safe)
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an RPC request and get the JSON `result`
    async fn request_json(&self, method: &str, params: Vec<Value>) -> RpcResult<Value>;
}

/// Deserialize a JSON `result` into a typed value
pub fn deserialize_response<T: serde::de::DeserializeOwned>(value: Value) -> RpcResult<T> {
    serde_json::from_value(value).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Mock transport for testing
///
/// Answers each method from a custom response, a scripted error or a
/// built-in default, in that order, and counts calls per method.
pub struct MockTransport {
    responses: Mutex<HashMap<String, Value>>,
    errors: Mutex<HashMap<String, RpcError>>,
    defaults: HashMap<String, Value>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert("eth_chainId".to_string(), Value::from("0x1"));
        defaults.insert("eth_gasPrice".to_string(), Value::from("0x3b9aca00")); // 1 gwei
        defaults.insert("eth_maxPriorityFeePerGas".to_string(), Value::from("0x3b9aca00"));
        defaults.insert("eth_blockNumber".to_string(), Value::from("0x100"));
        defaults.insert("eth_getBalance".to_string(), Value::from("0xde0b6b3a7640000")); // 1 ETH
        defaults.insert("eth_getTransactionCount".to_string(), Value::from("0x0"));
        defaults.insert("eth_getTransactionReceipt".to_string(), Value::Null);
        defaults.insert("web3_clientVersion".to_string(), Value::from("Mock/v1.0.0"));
        defaults.insert(
            "eth_sendRawTransaction".to_string(),
            Value::from("0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b"),
        );

        Self {
            responses: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            defaults,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Set a mock response for a specific method
    pub fn set_response(&self, method: &str, response: Value) {
        self.errors.lock().remove(method);
        self.responses.lock().insert(method.to_string(), response);
    }

    /// Make a method fail with the given error
    pub fn set_error(&self, method: &str, error: RpcError) {
        self.errors.lock().insert(method.to_string(), error);
    }

    /// Clear custom responses and errors
    pub fn clear_responses(&self) {
        self.responses.lock().clear();
        self.errors.lock().clear();
    }

    /// Number of calls made to a method
    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request_json(&self, method: &str, _params: Vec<Value>) -> RpcResult<Value> {
        *self.calls.lock().entry(method.to_string()).or_insert(0) += 1;

        if let Some(error) = self.errors.lock().get(method).cloned() {
            return Err(error);
        }
        if let Some(response) = self.responses.lock().get(method).cloned() {
            return Ok(response);
        }
        if let Some(response) = self.defaults.get(method).cloned() {
            return Ok(response);
        }

        Err(RpcError::Rpc {
            code: -32601,
            message: format!("Method not found: {}", method),
        })
    }
}

/// HTTP transport for real RPC communication
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    timeout: std::time::Duration,
    request_id: std::sync::atomic::AtomicU64,
}

#[cfg(feature = "http")]
impl HttpTransport {
    /// Create a new HTTP transport with extra request headers and a per-request timeout
    pub fn new(
        url: &str,
        headers: &[(String, String)],
        timeout: std::time::Duration,
    ) -> RpcResult<Self> {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| RpcError::InvalidEndpoint(format!("header {}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RpcError::InvalidEndpoint(format!("header {}: {}", key, e)))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            timeout,
            request_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Target URL
    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.request_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    fn map_error(&self, e: reqwest::Error) -> RpcError {
        if e.is_timeout() {
            RpcError::Timeout(self.timeout.as_millis() as u64)
        } else {
            RpcError::Transport(e.to_string())
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn request_json(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let response: JsonRpcResponse = response.json().await.map_err(|e| self.map_error(e))?;

        if let Some(error) = response.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        // A missing result is a JSON null, e.g. an unknown receipt
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[cfg(feature = "http")]
#[derive(serde::Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[cfg(feature = "http")]
#[derive(serde::Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}
