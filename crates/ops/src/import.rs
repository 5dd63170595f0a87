//! The import process: drive a format reader over one or more files, one
//! transaction per file. A failing file is logged and skipped; the rest of
//! the batch still imports.

use crate::config::Config;
use crate::reader::Reader;
use crate::Result;
use corpus::{Mapping, MappingSpec, StagingBuffer, Store};
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub db: PathBuf,
    /// Format identifier, resolved against the reader registry.
    pub mode: String,
    pub username: String,
    /// Unit type → identifying feature, for merge-on resolution.
    pub merge_on: HashMap<String, String>,
    pub mappings: Vec<MappingSpec>,
    pub infiles: Vec<PathBuf>,
}

impl ImportConfig {
    pub fn from_config(conf: &Config) -> Result<ImportConfig> {
        Ok(ImportConfig {
            db: conf.required("import", "db")?,
            mode: conf.required("import", "mode")?,
            username: conf.username("import")?,
            merge_on: conf.param_or("import", "merge_on", HashMap::new())?,
            mappings: conf.param_or("import", "mappings", Vec::new())?,
            infiles: conf.required("import", "infiles")?,
        })
    }
}

/// Import every configured file through `reader`. Returns how many files
/// imported cleanly.
pub fn run(store: &Store, reader: &mut dyn Reader, cfg: &ImportConfig) -> Result<usize> {
    let mapping = Mapping::from_specs(&cfg.mappings)?;
    let mut buffer = StagingBuffer::new(store, &cfg.username);
    buffer.set_mapping(&mapping);
    buffer.set_merge_on(cfg.merge_on.clone());
    let mut imported = 0;
    for path in &cfg.infiles {
        let location = path.display().to_string();
        let start = Instant::now();
        let outcome = store.transaction(|| -> Result<()> {
            let file = std::fs::File::open(path)?;
            let mut input = BufReader::new(file);
            reader.read(&mut input, &mut buffer, &location)
        });
        match outcome {
            Ok(()) => {
                imported += 1;
                tracing::info!(
                    "read '{}' in {:.3} seconds",
                    location,
                    start.elapsed().as_secs_f64()
                );
            }
            Err(err) => {
                buffer.discard_block();
                tracing::error!("import of '{}' failed: {}", location, err);
            }
        }
    }
    Ok(imported)
}
