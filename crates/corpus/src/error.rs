use crate::value::ValueType;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("annotation database error")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database file {} does not exist", .0.display())]
    NoSuchDatabase(PathBuf),
    #[error("database schema is version {major}.{minor}; this build expects {}.{}",
            crate::SCHEMA_MAJOR, crate::SCHEMA_MINOR)]
    SchemaVersion { major: i64, minor: i64 },

    #[error("unknown value type '{0}'")]
    UnknownValueType(String),
    #[error("invalid feature name '{0}' (expected 'tier:feature')")]
    InvalidFeature(String),
    #[error("feature '{name}' does not exist for unit type '{unittype}'")]
    UnknownFeature { name: String, unittype: String },
    #[error("feature '{name}' for '{unittype}' already exists with value type {existing}")]
    FeatureTypeConflict {
        name: String,
        unittype: String,
        existing: ValueType,
    },
    #[error("feature '{feature}' expects a value of type {expected}")]
    TypeMismatch {
        feature: String,
        expected: ValueType,
    },
    #[error("stored value for '{feature}' cannot be read as {valuetype}")]
    UndecodableValue {
        feature: String,
        valuetype: ValueType,
    },
    #[error("unit {0} does not exist")]
    MissingUnit(i64),

    #[error("the list of suggested values must be non-empty")]
    EmptyDistribution,
    #[error("suggestion probabilities must be positive")]
    NonPositiveProbability,

    #[error("unit '{0}' has not been assigned a type")]
    UntypedUnit(String),
    #[error("ref feature points at '{0}', which is not part of this block")]
    UnresolvedRef(String),

    #[error("invalid mapping: {0}")]
    InvalidMapping(String),
}
