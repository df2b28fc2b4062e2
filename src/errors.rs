use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote API error: {0}")]
    RemoteApi(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    StateConflict(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("provisioning step failed: {0}")]
    StepFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an error with the operation and target it came from.
    pub fn context(self, what: &str) -> Error {
        match self {
            Error::Transport(m) => Error::Transport(format!("{what}: {m}")),
            Error::RemoteApi(m) => Error::RemoteApi(format!("{what}: {m}")),
            other => other,
        }
    }
}
