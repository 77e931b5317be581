use thiserror::Error;

/// Errors surfaced by provider registry clients.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("consul reply is missing the X-Consul-Index header")]
    MissingIndex,

    #[error("invalid provider endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}
