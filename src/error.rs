//! Error types for instrumented clients, the function tracer and configuration

use thiserror::Error;

/// Failure of an LLM client call.
///
/// Instrumented wrappers never produce these themselves; whatever the original
/// implementation returns is handed back to the caller unchanged.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest_middleware::Error),

    #[error("HTTP {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("event stream error: {0}")]
    Stream(String),

    #[error("{0}")]
    Api(String),

    #[error("blocking runtime unavailable: {0}")]
    Runtime(#[from] std::io::Error),
}

impl ClientError {
    /// Short classification used for the `error.type` span attribute.
    pub fn error_type(&self) -> &'static str {
        match self {
            ClientError::Http(_) => "http",
            ClientError::Status { .. } => "status",
            ClientError::Decode(_) => "decode",
            ClientError::Stream(_) => "stream",
            ClientError::Api(_) => "api",
            ClientError::Runtime(_) => "runtime",
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(reqwest_middleware::Error::Reqwest(e))
    }
}

/// Misuse of the function tracer, reported before the wrapped call runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("invalid arguments for trace: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing {0} environment variable")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
