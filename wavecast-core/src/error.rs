use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mountpoint not found: {0}")]
    MountNotFound(String),

    #[error("file handle unavailable for {0}")]
    HandleUnavailable(String),

    #[error("format mismatched for {0}")]
    FormatMismatch(String),

    #[error("invalid range request")]
    InvalidRange,

    #[error("authenticator error: {0}")]
    Auth(String),

    #[error("unrecognised authenticator type: {0}")]
    UnknownAuthType(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
