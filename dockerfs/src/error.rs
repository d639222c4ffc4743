use http::Method;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("unexpected status {status} from {method} {url}")]
    Unexpected {
        method: Method,
        url: String,
        status: u16,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
