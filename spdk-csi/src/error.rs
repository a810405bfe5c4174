use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum CsiError {
    #[error("'{0}' not found")]
    NotFound(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("volume '{0}' is not published")]
    NotPublished(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("command '{command}' failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(#[from] Status),
}

pub type Result<T, E = CsiError> = std::result::Result<T, E>;

impl CsiError {
    /// Transient failures that a caller may retry with backoff. `NoSpace`
    /// is excluded: it calls for a new placement, not a repeat of the call.
    pub fn is_retryable(&self) -> bool {
        match self {
            CsiError::Timeout(_) | CsiError::Transport(_) => true,
            CsiError::Rpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::Aborted
                    | tonic::Code::DeadlineExceeded
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            CsiError::NotFound(_) => true,
            CsiError::Rpc(status) => status.code() == tonic::Code::NotFound,
            _ => false,
        }
    }

    /// Short label used for the `status` dimension of operation metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            CsiError::NotFound(_) => "not_found",
            CsiError::AlreadyExists(_) => "already_exists",
            CsiError::NotPublished(_) => "not_published",
            CsiError::NoSpace(_) | CsiError::ResourceExhausted(_) => "resource_exhausted",
            CsiError::Timeout(_) | CsiError::Transport(_) => "unavailable",
            CsiError::InvalidArgument(_) => "invalid_argument",
            _ => "internal",
        }
    }
}

impl From<reqwest::Error> for CsiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CsiError::Timeout(e.to_string())
        } else if e.is_decode() {
            CsiError::Backend(format!("malformed response: {}", e))
        } else {
            CsiError::Transport(e.to_string())
        }
    }
}

impl From<CsiError> for Status {
    fn from(e: CsiError) -> Self {
        match e {
            CsiError::NotFound(_) => Status::not_found(e.to_string()),
            CsiError::AlreadyExists(_) => Status::already_exists(e.to_string()),
            CsiError::NoSpace(_) | CsiError::ResourceExhausted(_) => {
                Status::resource_exhausted(e.to_string())
            }
            CsiError::Timeout(_) | CsiError::Transport(_) => Status::unavailable(e.to_string()),
            CsiError::InvalidArgument(_) => Status::invalid_argument(e.to_string()),
            CsiError::Rpc(status) => status,
            _ => Status::internal(e.to_string()),
        }
    }
}
