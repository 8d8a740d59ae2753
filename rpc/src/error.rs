//! Transport errors and the JSON-RPC error object.

use serde::{Deserialize, Serialize};

use crate::message::RequestId;

/// JSON-RPC standard and protocol-extension error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// LSP extension: the request was cancelled before completion.
    pub const REQUEST_CANCELLED: i64 = -32800;
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorObject {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(error_codes::REQUEST_CANCELLED, "request was cancelled")
    }
}

/// Errors raised on the requesting side of the peer.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No response arrived within the caller's timeout.
    #[error("request timed out")]
    ResponseTimeout,
    /// The peer went away before responding ("server was stopped").
    #[error("no response: {0}")]
    NoResponse(String),
    /// A response arrived but could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The peer answered with an error object.
    #[error("error on request ({code}): {message}")]
    ErrorOnRequest {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
    /// The request was cancelled via `$/cancelRequest`.
    #[error("request {0} was cancelled")]
    RequestCancelled(RequestId),
    /// The peer was stopped before the request could be sent.
    #[error("peer is stopped")]
    Stopped,
}

impl RpcError {
    /// Convert a peer error object, mapping the cancellation code to
    /// [`RpcError::RequestCancelled`].
    #[must_use]
    pub fn from_error_object(id: RequestId, error: ErrorObject) -> Self {
        if error.code == error_codes::REQUEST_CANCELLED {
            Self::RequestCancelled(id)
        } else {
            Self::ErrorOnRequest {
                code: error.code,
                message: error.message,
                data: error.data,
            }
        }
    }
}
