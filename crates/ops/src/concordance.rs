//! The concordance process: search for a pattern, then print a fixed-width
//! window of context around the matched centre unit, following primary
//! parent edges across block boundaries.

use crate::config::Config;
use crate::Result;
use corpus::span::get_span;
use corpus::{Mapping, Store};
use query::{build_query, search, QuerySpec};
use serde::Deserialize;
use std::io::Write;

/// A feature of a named query unit, used to label output lines.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelSpec {
    pub unit: String,
    pub feature: String,
}

#[derive(Debug, Clone)]
pub struct ConcordanceConfig {
    /// Query unit the window centres on.
    pub center: String,
    pub width: usize,
    /// Feature rendered for every unit of the window.
    pub print: String,
    pub label: Vec<LabelSpec>,
}

impl ConcordanceConfig {
    pub fn from_config(conf: &Config) -> Result<ConcordanceConfig> {
        Ok(ConcordanceConfig {
            center: conf.param_or("concordance", "center", "Center".to_string())?,
            width: conf.param_or("concordance", "width", 2)?,
            print: conf.required("concordance", "print")?,
            label: conf.param_or("concordance", "label", Vec::new())?,
        })
    }
}

fn feature_text(store: &Store, unit: i64, feature: &str) -> Result<String> {
    let unittype = store.get_unit_type(unit)?;
    let (fid, _) = store.get_feature(&unittype, feature)?;
    Ok(store
        .get_feature_value(unit, fid)?
        .map(|v| v.to_string())
        .unwrap_or_else(|| "_".to_string()))
}

/// Print one line per match: optional labels, then the window of `print`
/// values. Corpus edges render as `_`.
pub fn run(
    store: &Store,
    spec: &QuerySpec,
    cfg: &ConcordanceConfig,
    out: &mut dyn Write,
) -> Result<usize> {
    let query = build_query(spec)?;
    let mut count = 0;
    for m in search(store, &Mapping::default(), &query)? {
        let center = match m.get(&cfg.center).and_then(|b| b.one()) {
            Some(center) => center,
            None => continue,
        };
        let mut line = String::new();
        if !cfg.label.is_empty() {
            let mut labels = Vec::with_capacity(cfg.label.len());
            for label in &cfg.label {
                let unit = match m.get(&label.unit).and_then(|b| b.one()) {
                    Some(unit) => unit,
                    None => continue,
                };
                labels.push(feature_text(store, unit, &label.feature)?);
            }
            line.push_str(&labels.join(" "));
            line.push_str(": ");
        }
        let span = get_span(store, center, cfg.width)?;
        let window: Vec<String> = span
            .iter()
            .map(|slot| match slot {
                Some(unit) => feature_text(store, *unit, &cfg.print),
                None => Ok("_".to_string()),
            })
            .collect::<Result<_>>()?;
        line.push_str(&window.join(" "));
        writeln!(out, "{}", line)?;
        count += 1;
    }
    Ok(count)
}
