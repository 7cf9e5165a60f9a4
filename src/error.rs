/// Error types for DigiLocker OAuth and PKCE operations
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("Secure randomness unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("Invalid code verifier length {0}, must be between 43 and 128")]
    InvalidLength(usize),

    #[error("Invalid code verifier: {0}")]
    InvalidVerifier(String),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state parameter")]
    InvalidState,

    #[error("Authorization session expired")]
    SessionExpired,

    #[error("Authorization denied by user")]
    AuthorizationDenied,

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("Invalid client")]
    InvalidClient,

    #[error("OAuth error: {error}, description: {description:?}")]
    OAuthErrorResponse {
        error: String,
        description: Option<String>,
    },

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Timed out waiting for authorization callback")]
    CallbackTimeout,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OAuthError>;
