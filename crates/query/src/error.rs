pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A fault in the textual query mini-language. Always carries the line
    /// the tokeniser or parser was looking at.
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("no unit named '{0}'")]
    UnknownUnit(String),
    #[error("unit type '{0}' is not defined in this corpus")]
    UnknownUnitType(String),
    #[error("feature '{feature}' does not exist for unit type {unittypes:?}")]
    UnknownFeature {
        feature: String,
        unittypes: Vec<String>,
    },
    #[error("cannot sort unit '{unit}' by '{feature}': its definitions disagree on value type")]
    MixedOrderTypes { unit: String, feature: String },
    #[error("adjacency constraints only make sense between units of the same type ('{left}' is not '{right}')")]
    AdjacencyTypeMismatch { left: String, right: String },
    #[error("'{0}' cannot both be a multi-node and be referenced as a parent")]
    MultiNodeParent(String),
    #[error("cannot have both '{0}' and '{1}' as multi-nodes")]
    MultipleMultiNodes(String, String),
    #[error("'{op}' expects unit operands")]
    GraphOperandNotUnit { op: &'static str },
    #[error("invalid query specifier: {0}")]
    InvalidSpec(String),

    #[error("annotation database error")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Corpus(#[from] corpus::Error),
}

impl Error {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Error {
        Error::Parse {
            line,
            message: message.into(),
        }
    }
}
