//! Error types for the gateway.
//!
//! Upstream errors (a provider answering with status >= 400) are not errors
//! here: they are relayed to the caller as a normal outcome.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("{message}")]
    ProtocolMismatch { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Upstream timed out: {message}")]
    Timeout { message: String },

    #[error("Upstream transport error: {message}")]
    Transport { message: String },

    #[error("Unreadable upstream response: {message}")]
    UpstreamBody { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Self::ProtocolMismatch {
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout {
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    pub fn upstream_body(msg: impl Into<String>) -> Self {
        Self::UpstreamBody {
            message: msg.into(),
        }
    }

    /// Classify a reqwest failure; timeouts get their own status.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_decode() {
            Self::upstream_body(err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }

    /// HTTP status the caller sees.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::ProtocolMismatch { .. } | Self::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport { .. } | Self::UpstreamBody { .. } | Self::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Config { .. } | Self::Io(_) | Self::Toml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind used in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } | Self::ProtocolMismatch { .. } | Self::Json(_) => {
                "invalid_request_error"
            }
            Self::Unauthorized { .. } => "authentication_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Transport { .. } | Self::UpstreamBody { .. } | Self::Http(_) => "api_error",
            Self::Config { .. } | Self::Io(_) | Self::Toml(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
