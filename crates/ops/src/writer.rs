//! The seam format writers plug into: declare a query, then drain the
//! resulting table tuple-by-tuple into an output stream.

use crate::{Error, Result};
use query::{QuerySpec, ResultTable, UnitSpec};
use std::collections::BTreeMap;
use std::io::Write;

pub trait Writer {
    /// The pattern whose matches this writer renders.
    fn query(&self) -> QuerySpec;

    /// Render the executed table. Implementations call the table's
    /// projection methods (`add_features`, `add_tier`, `add_children`) and
    /// then iterate `results()`.
    fn write(&mut self, table: &mut ResultTable, out: &mut dyn Write) -> Result<()>;
}

/// Replace unit declarations of `spec` wholesale with caller-provided
/// overrides. Unknown names are ignored.
pub fn apply_query_updates(spec: &mut QuerySpec, updates: &BTreeMap<String, UnitSpec>) {
    for (name, unit) in updates {
        if spec.contains_key(name) {
            spec.insert(name.clone(), unit.clone());
        }
    }
}

/// Explicit writer registry, keyed by format identifier.
#[derive(Default)]
pub struct Writers {
    entries: BTreeMap<String, Box<dyn Fn() -> Box<dyn Writer>>>,
}

impl Writers {
    pub fn new() -> Writers {
        Writers::default()
    }

    pub fn register(
        &mut self,
        identifier: impl Into<String>,
        factory: impl Fn() -> Box<dyn Writer> + 'static,
    ) {
        self.entries.insert(identifier.into(), Box::new(factory));
    }

    pub fn create(&self, identifier: &str) -> Result<Box<dyn Writer>> {
        self.entries
            .get(identifier)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownFormat(identifier.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
