//! Error types for mesh-discovery.

use std::fmt;

use http::StatusCode;
use serde::Deserialize;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection, I/O or timeout failure talking to the registry.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The registry refused our identity or signature.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The registry answered with a non-success status and an error body.
    #[error("Registry error: {0}")]
    Registry(RegistryError),

    /// The registry answered with a body we could not decode.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration supplied at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stat value could not be parsed.
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue {
        /// The stat key being changed.
        key: String,
        /// Why the raw value was rejected.
        reason: String,
    },
}

impl Error {
    /// Create an authentication error.
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the registry reported that this node cannot be reached from
    /// the registry's vantage point.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Registry(e) if e.is_unreachable())
    }

    /// Whether the same request may succeed if simply tried again later.
    ///
    /// Authentication failures and "unreachable" rejections are terminal;
    /// everything the network or the registry can recover from is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Protocol(_) => true,
            Self::Registry(e) => !e.is_unreachable(),
            Self::Auth(_) | Self::Config(_) | Self::InvalidValue { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Structured rejection decoded from a registry response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryError {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Error message supplied by the registry.
    pub message: String,
}

const UNREACHABLE_MARKER: &str = "unreachable";

impl RegistryError {
    /// Whether this rejection says the node is unreachable.
    pub fn is_unreachable(&self) -> bool {
        self.message.to_ascii_lowercase().contains(UNREACHABLE_MARKER)
    }

    /// Decode a registry error body.
    ///
    /// Accepts `{"error": {"code", "message"}}`, `{"error": "..."}` and a bare
    /// `{"code", "message"}`.
    pub fn from_body(status: StatusCode, body: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Detail {
            #[serde(default)]
            code: Option<u16>,
            message: String,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Inner {
            Detail(Detail),
            Text(String),
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Body {
            Wrapped { error: Inner },
            Bare(Detail),
        }

        let body: Body = serde_json::from_slice(body).map_err(|e| {
            Error::protocol(format!("undecodable error body (status {status}): {e}"))
        })?;

        let (code, message) = match body {
            Body::Wrapped {
                error: Inner::Detail(d),
            }
            | Body::Bare(d) => (d.code, d.message),
            Body::Wrapped {
                error: Inner::Text(message),
            } => (None, message),
        };

        let status = code
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(status);

        Ok(Self { status, message })
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for RegistryError {}
