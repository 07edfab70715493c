use thiserror::Error;

/// Main error type for the rotapool gateway
#[derive(Error, Debug)]
pub enum RotapoolError {
    /// Configuration related errors (fatal at startup)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Source loading errors (recorded in updater status, never fatal)
    #[error("Source error: {message}")]
    Source { message: String },

    /// Health probe errors
    #[error("Health check error: {message}")]
    Health { message: String },

    /// Upstream pool errors
    #[error("Pool error: {message}")]
    Pool { message: String },

    /// Proxy request errors
    #[error("Proxy error: {message}")]
    Proxy { message: String },

    /// SOCKS5 protocol errors
    #[error("SOCKS5 error: {message}")]
    Socks { message: String },

    /// External tunnel adapter errors
    #[error("Adapter error: {message}")]
    Adapter { message: String },

    /// Operation timed out
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// IO related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RotapoolError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn source<S: Into<String>>(message: S) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    pub fn health<S: Into<String>>(message: S) -> Self {
        Self::Health {
            message: message.into(),
        }
    }

    pub fn pool<S: Into<String>>(message: S) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    pub fn proxy<S: Into<String>>(message: S) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    pub fn socks<S: Into<String>>(message: S) -> Self {
        Self::Socks {
            message: message.into(),
        }
    }

    pub fn adapter<S: Into<String>>(message: S) -> Self {
        Self::Adapter {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether a data-plane retry against another upstream can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Proxy { .. } | Self::Socks { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }
}

impl From<hyper::Error> for RotapoolError {
    fn from(err: hyper::Error) -> Self {
        Self::Proxy {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for RotapoolError {
    fn from(err: reqwest::Error) -> Self {
        Self::Source {
            message: err.to_string(),
        }
    }
}

pub type RotapoolResult<T> = Result<T, RotapoolError>;
