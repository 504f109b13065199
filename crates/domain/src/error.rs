/// Shared error type used across all ToolBridge crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    /// Token refresh failed and no valid fallback credentials exist.
    /// The HTTP layer signals the UI to run the consent flow again.
    #[error("server '{0}' requires re-authentication")]
    RequiresAuthentication(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
