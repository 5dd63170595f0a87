//! The transform process: resolve named rewrite rules from the
//! configuration document and apply each in sequence.

use crate::config::Config;
use crate::Result;
use corpus::{Mapping, Store};
use query::{build_query, QuerySpec};
use serde::Deserialize;
use transform::{Command, Program};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformRule {
    pub query: QuerySpec,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub sequence: Vec<String>,
    pub username: String,
    pub confidence: i64,
    pub fatal: bool,
}

impl TransformConfig {
    pub fn from_config(conf: &Config) -> Result<TransformConfig> {
        Ok(TransformConfig {
            sequence: conf.required("transform", "sequence")?,
            username: conf.username("transform")?,
            confidence: conf.param_or("transform", "confidence", 1)?,
            fatal: conf.param_or("transform", "fatal", false)?,
        })
    }
}

/// Apply each named rule in order. Returns the total number of commands
/// applied across all rules.
pub fn run(store: &Store, conf: &Config, cfg: &TransformConfig) -> Result<u64> {
    let mut applied = 0;
    for rule in &cfg.sequence {
        let rule: TransformRule = conf.required("transform", rule)?;
        let program = Program {
            query: build_query(&rule.query)?,
            commands: rule.commands,
        };
        applied += transform::apply(
            store,
            &Mapping::default(),
            &program,
            &cfg.username,
            cfg.confidence,
            cfg.fatal,
        )?;
    }
    Ok(applied)
}
