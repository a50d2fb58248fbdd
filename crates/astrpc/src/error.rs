//! # Error Definitions
//!
//! Wire error codes, the error object carried in responses, and failures of
//! the codec itself.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Error codes carried in the `error.code` field of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerError,
    /// Iteration exhausted. Not a failure.
    StopAsyncIteration,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::StopAsyncIteration => -32099,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::InvalidRequest),
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::InternalError),
            -32000 => Some(Self::ServerError),
            -32099 => Some(Self::StopAsyncIteration),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ParseError => "ParseError",
            Self::InvalidRequest => "InvalidRequest",
            Self::MethodNotFound => "MethodNotFound",
            Self::InvalidParams => "InvalidParams",
            Self::InternalError => "InternalError",
            Self::ServerError => "ServerError",
            Self::StopAsyncIteration => "StopAsyncIterationError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// The `error` object of a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// An error whose message is the code's name and whose data is `detail`.
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            code: code.code(),
            message: code.name().to_string(),
            data: if detail.is_empty() { None } else { Some(Value::String(detail)) },
        }
    }

    /// The iteration-exhausted sentinel: the code alone, with an empty message.
    pub fn stop_iteration() -> Self {
        Self {
            code: ErrorCode::StopAsyncIteration.code(),
            message: String::new(),
            data: None,
        }
    }

    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn is_stop_iteration(&self) -> bool {
        self.kind() == Some(ErrorCode::StopAsyncIteration)
    }

    /// The human-readable detail: `data` when it is a string, else `message`.
    pub fn detail(&self) -> &str {
        match &self.data {
            Some(Value::String(s)) => s,
            _ => &self.message,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(Value::String(s)) => write!(f, "{} ({}): {}", self.message, self.code, s),
            Some(other) => write!(f, "{} ({}): {}", self.message, self.code, other),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

impl std::error::Error for RpcError {}

/// Failures while encoding or decoding frames and nodes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("malformed frame: {0}")]
    Parse(#[from] serde_json::Error),
    /// The frame was JSON but not a request or response. Carries the id when
    /// one could be read.
    #[error("invalid request: {reason}")]
    InvalidRequest { id: Option<String>, reason: String },
    /// A node named an operation outside the protocol.
    #[error("unknown operation '{name}'")]
    UnknownOperation { id: Option<String>, name: String },
    /// The nested depth of a node exceeded the codec limit.
    #[error("node nesting exceeds {0} levels")]
    RecursionLimitExceeded(usize),
}

impl ProtocolError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest { id: None, reason: reason.into() }
    }

    /// The wire code this failure is answered with.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::UnknownOperation { .. } => ErrorCode::MethodNotFound,
            Self::RecursionLimitExceeded(_) => ErrorCode::InvalidRequest,
        }
    }

    /// The id of the offending message, if it could be recovered.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::InvalidRequest { id, .. } | Self::UnknownOperation { id, .. } => id.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn with_id(self, request_id: &str) -> Self {
        match self {
            Self::InvalidRequest { reason, .. } => Self::InvalidRequest { id: Some(request_id.to_string()), reason },
            Self::UnknownOperation { name, .. } => Self::UnknownOperation { id: Some(request_id.to_string()), name },
            Self::RecursionLimitExceeded(_) => Self::InvalidRequest {
                id: Some(request_id.to_string()),
                reason: self.to_string(),
            },
            other => other,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        RpcError::new(self.code(), self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
