use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stored value for `{key}` has the wrong type")]
    TypeMismatch { key: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("value too long for {0}")]
    TooLong(&'static str),
    #[error("network driver error: {0}")]
    Driver(String),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is not running")]
    NotStarted(&'static str),
}
