//! The distribution process: a frequency list over the children of a
//! matched unit, rendered as one pattern line per match and counted.
//! `include` features from other pattern units become extra leading columns,
//! so counts can be grouped by, say, a sentence-level feature.

use crate::config::Config;
use crate::Result;
use corpus::{Mapping, Store, Value};
use itertools::Itertools;
use query::{build_query, QuerySpec, ResultTable};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;

/// A feature of a named (non-child) query unit, counted alongside the child
/// pattern.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncludeSpec {
    pub unit: String,
    pub feature: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributionConfig {
    /// Query unit whose primary children are counted.
    #[serde(default = "default_center")]
    pub center: String,
    pub child_type: String,
    /// Features rendered per child, slash-joined.
    pub child_print: Vec<String>,
    /// Feature the children sort by within each match.
    #[serde(default = "default_sort")]
    pub sort: String,
    /// Features from the pattern to include as grouping columns.
    #[serde(default)]
    pub include: Vec<IncludeSpec>,
}

fn default_center() -> String {
    "Center".to_string()
}

fn default_sort() -> String {
    "meta:index".to_string()
}

impl DistributionConfig {
    pub fn from_config(conf: &Config) -> Result<DistributionConfig> {
        Ok(DistributionConfig {
            center: conf.param_or("distribution", "center", default_center())?,
            child_type: conf.required("distribution", "child_type")?,
            child_print: conf.required("distribution", "child_print")?,
            sort: conf.param_or("distribution", "sort", default_sort())?,
            include: conf.param_or("distribution", "include", Vec::new())?,
        })
    }
}

pub fn run(
    store: &Store,
    spec: &QuerySpec,
    cfg: &DistributionConfig,
    out: &mut dyn Write,
) -> Result<()> {
    let query = build_query(spec)?;
    let mut table = ResultTable::new(store, &query, Mapping::default())?;
    let children = match table.add_children(&cfg.center, &cfg.child_type)? {
        Some(children) => children,
        None => return Ok(()),
    };
    table.add_features(&children, &cfg.child_print, true, true)?;
    table.add_features(&children, std::slice::from_ref(&cfg.sort), true, false)?;
    for inc in &cfg.include {
        table.add_features(&inc.unit, std::slice::from_ref(&inc.feature), true, true)?;
    }

    let mut counts: HashMap<String, u64> = HashMap::new();
    for (bindings, features) in table.results() {
        let mut line: Vec<String> = Vec::with_capacity(cfg.include.len() + 1);
        for inc in &cfg.include {
            let value = bindings
                .get(&inc.unit)
                .and_then(|binding| binding.one())
                .and_then(|unit| features.get(&unit))
                .and_then(|carried| carried.get(&inc.feature))
                .map(Value::to_string)
                .unwrap_or_else(|| "_".to_string());
            line.push(value);
        }
        let mut kids = bindings[&children].ids().to_vec();
        kids.sort_by_key(|kid| {
            features
                .get(kid)
                .and_then(|f| f.get(&cfg.sort))
                .and_then(Value::as_int)
                .unwrap_or(0)
        });
        let pattern = kids
            .iter()
            .map(|kid| {
                cfg.child_print
                    .iter()
                    .map(|feature| {
                        features
                            .get(kid)
                            .and_then(|f| f.get(feature))
                            .map(Value::to_string)
                            .unwrap_or_else(|| "_".to_string())
                    })
                    .join("/")
            })
            .join(" ");
        line.push(pattern);
        *counts.entry(line.join("\t")).or_default() += 1;
    }

    let mut header: Vec<&str> = vec!["Count"];
    header.extend(cfg.include.iter().map(|inc| inc.feature.as_str()));
    header.push("Items");
    writeln!(out, "{}", header.join("\t"))?;
    let ordered = counts
        .into_iter()
        .sorted_by(|(pattern_a, count_a), (pattern_b, count_b)| {
            count_b.cmp(count_a).then_with(|| pattern_a.cmp(pattern_b))
        });
    for (pattern, count) in ordered {
        writeln!(out, "{}\t{}", count, pattern)?;
    }
    Ok(())
}
