use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("external service failed: {0}")]
    Service(#[from] ServiceError),

    #[error("vector store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("vector count {vectors} doesn't match metadata count {metadata}")]
    LengthMismatch { vectors: usize, metadata: usize },

    #[error("store artifacts are inconsistent: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} throttled the request: {details}")]
    RateLimited { service: String, details: String },

    #[error("{service} still throttled after {attempts} attempts")]
    RetriesExhausted { service: String, attempts: u32 },

    #[error("invalid response from {service}: {details}")]
    BackendResponse { service: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("analyzer failed: {0}")]
    Analyzer(String),
}

impl ServiceError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("external service failed: {0}")]
    Service(#[from] ServiceError),

    #[error("vector store failed: {0}")]
    Store(#[from] StoreError),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("regex error: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
