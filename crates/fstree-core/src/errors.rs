use thiserror::Error;

/// Typed failure categories. Most errors travel through `anyhow` with path
/// context attached at the failing call; these variants exist for the cases a
/// caller needs to match on, recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("remote failure: {message} (status {status})")]
    Remote { status: u16, message: String },

    #[error("lock failure: {0}")]
    Lock(String),
}

impl Error {
    /// True when an `anyhow` chain bottoms out in the unsupported-capability
    /// category. The push pipeline branches on this to fall back from
    /// `has_tree` to per-object probing.
    pub fn is_unsupported(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::Unsupported(_)))
    }
}
