//! The conditional-probability process: how often each value of a target
//! feature occurs on the matched centre unit, conditioned on the values of
//! other features it carries.

use crate::config::Config;
use crate::Result;
use corpus::{Mapping, Store};
use itertools::Itertools;
use query::{build_query, QuerySpec, ResultTable};
use std::collections::BTreeMap;
use std::io::Write;

#[derive(Debug, Clone)]
pub struct ProbabilityConfig {
    /// Query unit whose features are tallied.
    pub center: String,
    pub target_feature: String,
    /// Candidate conditioning features.
    pub features: Vec<String>,
    /// Largest number of features conditioned on at once.
    pub max_combinations: usize,
}

impl ProbabilityConfig {
    pub fn from_config(conf: &Config) -> Result<ProbabilityConfig> {
        Ok(ProbabilityConfig {
            center: conf.param_or("conditional_probability", "center", "Center".to_string())?,
            target_feature: conf.required("conditional_probability", "target_feature")?,
            features: conf.required("conditional_probability", "features")?,
            max_combinations: conf.param_or("conditional_probability", "max_combinations", 2)?,
        })
    }
}

type Tally = BTreeMap<Vec<String>, BTreeMap<Vec<String>, BTreeMap<String, u64>>>;

pub fn run(
    store: &Store,
    spec: &QuerySpec,
    cfg: &ProbabilityConfig,
    out: &mut dyn Write,
) -> Result<()> {
    let query = build_query(spec)?;
    let mut table = ResultTable::new(store, &query, Mapping::default())?;
    let mut wanted = vec![cfg.target_feature.clone()];
    wanted.extend(cfg.features.iter().cloned());
    table.add_features(&cfg.center, &wanted, true, true)?;

    let mut result_count = 0u64;
    let mut target_count = 0u64;
    // condition features → their values → target value → count
    let mut tallies: Tally = BTreeMap::new();
    for (bindings, features) in table.results() {
        result_count += 1;
        let center = match bindings.get(&cfg.center).and_then(|b| b.one()) {
            Some(center) => center,
            None => continue,
        };
        let carried = match features.get(&center) {
            Some(carried) => carried,
            None => continue,
        };
        let target = match carried.get(&cfg.target_feature) {
            Some(target) => target.to_string(),
            None => continue,
        };
        target_count += 1;
        let present: Vec<&String> = cfg
            .features
            .iter()
            .filter(|f| carried.contains_key(*f))
            .collect();
        for size in 1..=cfg.max_combinations {
            for keys in present.iter().combinations(size) {
                let names: Vec<String> = keys.iter().map(|k| (**k).clone()).collect();
                let values: Vec<String> = keys
                    .iter()
                    .map(|k| carried[k.as_str()].to_string())
                    .collect();
                *tallies
                    .entry(names)
                    .or_default()
                    .entry(values)
                    .or_default()
                    .entry(target.clone())
                    .or_default() += 1;
            }
        }
    }

    // Narrow conditionings print first: every 1-feature block precedes any
    // 2-feature block, lexicographic within a width.
    let mut ordered: Vec<_> = tallies.iter().collect();
    ordered.sort_by(|(condition_a, _), (condition_b, _)| {
        condition_a
            .len()
            .cmp(&condition_b.len())
            .then_with(|| condition_a.cmp(condition_b))
    });
    for (condition, by_values) in ordered {
        writeln!(out, "Conditioning on {}:", condition.iter().join(", "))?;
        for (values, counts) in by_values {
            let given = condition
                .iter()
                .zip(values)
                .map(|(name, value)| format!("{}={:?}", name, value))
                .join(", ");
            let total: u64 = counts.values().sum();
            writeln!(out, "\tP({} = _ | {})", cfg.target_feature, given)?;
            for (value, count) in counts {
                writeln!(
                    out,
                    "\t\t{:?} => {} / {} = {:.4}%",
                    value,
                    count,
                    total,
                    100.0 * *count as f64 / total as f64
                )?;
            }
        }
        writeln!(out)?;
    }
    let share = if result_count == 0 {
        0.0
    } else {
        100.0 * target_count as f64 / result_count as f64
    };
    writeln!(
        out,
        "Query had {} results, {} ({:.4}%) of which contained the target feature.",
        result_count, target_count, share
    )?;
    Ok(())
}
