//! The persistent representation of an annotation corpus: a typed graph of
//! units, features, and relations in a single-file SQLite database, plus the
//! staging buffer importers flush blocks through and the vocabulary mapping
//! applied at the conversion boundary.

mod error;
mod mapping;
pub mod span;
mod staging;
mod store;
mod value;

use rusqlite::Connection;
use std::path::Path;

pub use error::{Error, Result};
pub use mapping::{Mapping, MappingSpec};
pub use staging::{StagedValue, StagingBuffer};
pub use store::{FeatureDef, Store};
pub use value::{join_feature, split_feature, Value, ValueType};

pub const SCHEMA_MAJOR: i64 = 1;
pub const SCHEMA_MINOR: i64 = 0;

/// Create a new and empty annotation database, returning an open store. Any
/// existing database at the given path is truncated. `":memory:"` is
/// accepted for tests and scratch work.
pub fn create(path: &str) -> Result<Store> {
    if path != ":memory:" {
        // Create or truncate the database at |path|.
        std::fs::write(path, [])?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("BEGIN;")?;
    conn.execute_batch(include_str!("schema.sql"))?;
    conn.execute_batch("COMMIT;")?;
    Ok(Store::new(conn))
}

/// Open an existing annotation database. The file must exist and carry the
/// schema version this build writes.
pub fn open(path: impl AsRef<Path>) -> Result<Store> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NoSuchDatabase(path.to_path_buf()));
    }
    let conn = Connection::open(path)?;
    check_schema_version(&conn)?;
    Ok(Store::new(conn))
}

/// Open `path` if it exists, otherwise create it. The importer's usual entry
/// point.
pub fn open_or_create(path: impl AsRef<Path>) -> Result<Store> {
    let path = path.as_ref();
    if path.exists() {
        open(path)
    } else {
        create(&path.to_string_lossy())
    }
}

fn check_schema_version(conn: &Connection) -> Result<()> {
    let (major, minor): (i64, i64) = conn.query_row(
        "SELECT schema_major, schema_minor FROM metadata",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if (major, minor) != (SCHEMA_MAJOR, SCHEMA_MINOR) {
        return Err(Error::SchemaVersion { major, minor });
    }
    Ok(())
}
