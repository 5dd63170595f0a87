pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing required parameter '{name}' for {process}")]
    MissingParameter { process: String, name: String },
    #[error("parameter '{name}' for {process}: {detail}")]
    InvalidParameter {
        process: String,
        name: String,
        detail: String,
    },
    #[error("unknown format '{0}'")]
    UnknownFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Corpus(#[from] corpus::Error),
    #[error(transparent)]
    Query(#[from] query::Error),
    #[error(transparent)]
    Transform(#[from] transform::Error),
}

/// The per-block result of a reader. `Abandoned` is fatal to the block but
/// not to the file: the loop logs it, discards the staged block, and resumes
/// at the next boundary.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("{0}")]
    Abandoned(String),
    #[error(transparent)]
    Fatal(#[from] Error),
}

impl BlockError {
    pub fn abandoned(message: impl Into<String>) -> BlockError {
        BlockError::Abandoned(message.into())
    }
}

impl From<corpus::Error> for BlockError {
    fn from(err: corpus::Error) -> BlockError {
        BlockError::Fatal(err.into())
    }
}
