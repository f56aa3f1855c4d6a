use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("token request failed: {0}")]
    Token(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
