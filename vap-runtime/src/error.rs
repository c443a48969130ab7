use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Marketplace error: HTTP {status} — {body}")]
    Marketplace { status: u16, body: String },

    #[error("Chat transport error: {0}")]
    Transport(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Sandbox request failed: {0}")]
    Sandbox(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<reqwest::Error> for DispatcherError {
    fn from(e: reqwest::Error) -> Self {
        DispatcherError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for DispatcherError {
    fn from(e: serde_json::Error) -> Self {
        DispatcherError::Serialization(e.to_string())
    }
}
