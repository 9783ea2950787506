use thiserror::Error;

/// Failures surfaced by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("unable to encode or decode stored value: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Failures talking to the upstream feature service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Http(String),
    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("unable to decode upstream response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unable to serialize compiled feature file: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum OverleashError {
    #[error("invalid data file index {index}, {count} environments configured")]
    InvalidEnvironmentIndex { index: usize, count: usize },
    #[error("{}", join_fetch_errors(.0))]
    Fetch(Vec<FetchFailure>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One environment that could not be refreshed.
#[derive(Debug, Error)]
#[error("environment {environment}: {source}")]
pub struct FetchFailure {
    pub environment: String,
    #[source]
    pub source: UpstreamError,
}

fn join_fetch_errors(failures: &[FetchFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
