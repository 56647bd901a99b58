use thiserror::Error;

use crate::task::TaskId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to render watermark: {0}")]
    Render(#[from] RenderError),

    #[error("Failed to watermark document: {0}")]
    Transform(#[from] TransformError),

    #[error("Remote storage error: {0}")]
    Remote(RemoteError),

    #[error("{action} '{target}' failed: {source}")]
    Walk {
        action: &'static str,
        target: String,
        #[source]
        source: RemoteError,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Invalid folder reference '{0}'")]
    InvalidReference(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Auth(msg) => Error::Auth(msg),
            RemoteError::NotFound(msg) => Error::NotFound(msg),
            other => Error::Remote(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("could not decode logo image: {0}")]
    Decode(String),

    #[error("invalid render options: {0}")]
    Options(String),

    #[error("could not finalize overlay page: {0}")]
    Finalize(String),
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("source is not a readable PDF: {0}")]
    Parse(String),

    #[error("overlay document has no pages")]
    EmptyOverlay,

    #[error("malformed page {page}: {reason}")]
    Page { page: u32, reason: String },

    #[error("could not write output PDF: {0}")]
    Write(String),
}

/// Failures reported by a [`RemoteTree`](crate::remote::RemoteTree).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("credential rejected: {0}")]
    Auth(String),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl RemoteError {
    /// Only transient failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}
