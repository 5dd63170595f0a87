//! The export process: execute the writer's query (with optional per-node
//! overrides), project it into a result table, and let the writer render it.

use crate::config::Config;
use crate::writer::{apply_query_updates, Writer};
use crate::Result;
use corpus::{Mapping, MappingSpec, Store};
use query::{build_query, ResultTable, UnitSpec};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub db: PathBuf,
    /// Format identifier, resolved against the writer registry.
    pub mode: String,
    pub outfile: PathBuf,
    pub mappings: Vec<MappingSpec>,
    pub query_updates: BTreeMap<String, UnitSpec>,
}

impl ExportConfig {
    pub fn from_config(conf: &Config) -> Result<ExportConfig> {
        Ok(ExportConfig {
            db: conf.required("export", "db")?,
            mode: conf.required("export", "mode")?,
            outfile: conf.required("export", "outfile")?,
            mappings: conf.param_or("export", "mappings", Vec::new())?,
            query_updates: conf.param_or("export", "query_updates", BTreeMap::new())?,
        })
    }
}

pub fn run(
    store: &Store,
    writer: &mut dyn Writer,
    cfg: &ExportConfig,
    out: &mut dyn Write,
) -> Result<()> {
    let mapping = Mapping::from_specs(&cfg.mappings)?;
    let mut spec = writer.query();
    apply_query_updates(&mut spec, &cfg.query_updates);
    let query = build_query(&spec)?;
    let mut table = ResultTable::new(store, &query, mapping)?;
    writer.write(&mut table, out)
}
