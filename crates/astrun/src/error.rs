//! # Error Definitions
//!
//! One error type for everything that can go wrong while building, sending or
//! evaluating a call chain. Each variant maps onto a wire [`ErrorCode`], so the
//! dispatcher can answer any failure without inspecting where it came from.

use astrpc::ErrorCode;
use astrpc::ProtocolError;
use astrpc::RpcError;

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A key was missing from every namespace tier, or a leaf was malformed.
    #[error("name '{0}' is not defined")]
    MethodNotFound(String),
    #[error("'{type_name}' object has no attribute '{name}'")]
    Attribute { type_name: String, name: String },
    #[error("'{0}' object is not callable")]
    NotCallable(String),
    #[error("'{0}' object is not async iterable")]
    NotIterable(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Raised by user code.
    #[error("{0}")]
    Internal(String),
    /// The iterator behind a continuation token has no more items.
    #[error("async iteration exhausted")]
    Exhausted,
    /// The peer answered with an error.
    #[error("remote error: {0}")]
    Remote(RpcError),
    #[error("no peer registered as '{0}'")]
    PeerNotFound(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("call timed out")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Converts a received error object, turning the exhaustion sentinel back
    /// into [`Error::Exhausted`].
    pub fn from_rpc(error: RpcError) -> Self {
        if error.is_stop_iteration() {
            return Self::Exhausted;
        }
        Self::Remote(error)
    }

    /// The wire code this error is answered with.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MethodNotFound(_)
            | Self::Attribute { .. }
            | Self::NotCallable(_)
            | Self::NotIterable(_)
            | Self::PeerNotFound(_) => ErrorCode::MethodNotFound,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Internal(_) => ErrorCode::InternalError,
            Self::Exhausted => ErrorCode::StopAsyncIteration,
            Self::Remote(e) => e.kind().unwrap_or(ErrorCode::InternalError),
            Self::AuthFailed | Self::ConnectionClosed | Self::Timeout | Self::Transport(_) => ErrorCode::ServerError,
            Self::Protocol(e) => e.code(),
        }
    }

    /// The error object sent back to the caller.
    pub fn to_rpc(&self) -> RpcError {
        match self {
            Self::Exhausted => RpcError::stop_iteration(),
            Self::Remote(e) => e.clone(),
            Self::AuthFailed => RpcError {
                code: ErrorCode::ServerError.code(),
                message: "AuthenticationFailed".to_string(),
                data: None,
            },
            other => RpcError::new(other.code(), other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
