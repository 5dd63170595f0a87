//! The query process: run a search and render each match, with the features
//! every node's `print` list asks for.

use crate::{Error, Result};
use corpus::{Mapping, Store};
use query::{build_query, search, QuerySpec};
use std::collections::HashMap;
use std::io::Write;

/// Render every match of `spec` to `out`. Returns the match count.
pub fn run(
    store: &Store,
    spec: &QuerySpec,
    mapping: &Mapping,
    out: &mut dyn Write,
) -> Result<usize> {
    // Resolve print features up front so a bad name fails before any output.
    let mut print_features: HashMap<String, Vec<(String, Vec<i64>)>> = HashMap::new();
    for (name, unit) in spec {
        let source_types = unit.unittype.to_vec();
        let stored_types = mapping.map_types(&source_types);
        let mut resolved = Vec::new();
        for feature in &unit.print {
            let stored = mapping.map_feature(feature, &source_types);
            let defs = store.get_feature_multi_type(&stored_types, &stored)?;
            if defs.is_empty() {
                return Err(Error::Query(query::Error::UnknownFeature {
                    feature: feature.clone(),
                    unittypes: source_types.clone(),
                }));
            }
            resolved.push((feature.clone(), defs.into_iter().map(|(id, _)| id).collect()));
        }
        print_features.insert(name.clone(), resolved);
    }

    let query = build_query(spec)?;
    let mut count = 0;
    for m in search(store, mapping, &query)? {
        count += 1;
        writeln!(out, "Result {}", count)?;
        for (name, binding) in &m.bindings {
            let features = match print_features.get(name) {
                Some(features) => features,
                None => continue,
            };
            for unit in binding.ids() {
                writeln!(out, "{} {}", name, unit)?;
                for (label, fids) in features {
                    for fid in fids {
                        if let Some(value) = store.get_feature_value(*unit, *fid)? {
                            writeln!(out, "\t{}\t{}", label, value)?;
                        }
                    }
                }
            }
        }
        writeln!(out)?;
    }
    Ok(count)
}
