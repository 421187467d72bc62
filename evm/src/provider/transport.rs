use std::fmt;

use alloy_json_rpc::RpcError;
use alloy_rpc_client::{ClientBuilder, RpcClient};
use alloy_transport::{BoxTransport, TransportErrorKind};
use serde_json::Value;
use url::Url;

/// Why a single JSON-RPC call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcFailure {
    /// The node answered with a JSON-RPC error object.
    JsonRpc { code: i64, message: String },
    /// The node answered with a non-success HTTP status.
    Http { status: u16, body: String },
    /// The attempt did not complete in time.
    Timeout,
    /// Connection, serialization or any other transport level error.
    Transport(String),
}

/// Sends raw JSON-RPC requests to a node.
#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure>;
}

/// JSON-RPC over HTTP.
pub struct HttpTransport {
    client: RpcClient<BoxTransport>,
}

impl HttpTransport {
    pub fn new(url: Url) -> Self {
        let client = ClientBuilder::default().http(url).boxed();
        Self { client }
    }
}

#[async_trait::async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        self.client
            .request::<Value, Value>(method.to_string(), params)
            .await
            .map_err(RpcFailure::from)
    }
}

impl From<RpcError<TransportErrorKind>> for RpcFailure {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        match error {
            RpcError::ErrorResp(payload) => RpcFailure::JsonRpc {
                code: payload.code,
                message: payload.message.to_string(),
            },
            RpcError::Transport(TransportErrorKind::HttpError(error)) => RpcFailure::Http {
                status: error.status,
                body: error.body,
            },
            other => RpcFailure::Transport(other.to_string()),
        }
    }
}

impl RpcFailure {
    /// Human readable text of the failure, used to detect provider specific errors.
    pub fn message(&self) -> &str {
        match self {
            RpcFailure::JsonRpc { message, .. } => message,
            RpcFailure::Http { body, .. } => body,
            RpcFailure::Timeout => "request timed out",
            RpcFailure::Transport(message) => message,
        }
    }
}

impl error_stack::Context for RpcFailure {}

impl fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcFailure::JsonRpc { code, message } => {
                write!(f, "json-rpc error {code}: {message}")
            }
            RpcFailure::Http { status, body } => write!(f, "http error {status}: {body}"),
            RpcFailure::Timeout => write!(f, "request timed out"),
            RpcFailure::Transport(message) => write!(f, "transport error: {message}"),
        }
    }
}
