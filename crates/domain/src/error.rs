/// Shared error type used across all leadflow crates.
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

    #[error("LLM provider: {0}")]
    Provider(String),

    /// The LLM returned output no extraction strategy could turn into a
    /// valid stage payload.
    #[error("LLM protocol: {0}")]
    Protocol(String),

    /// Messaging transport failure (inbound enqueue or outbound send).
    #[error("transport: {0}")]
    Transport(String),

    #[error("store: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a gateway-level caller should ask the sender to redeliver.
    /// Store failures are the only recoverable class before the inbound
    /// message has been recorded.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Io(_))
    }
}
