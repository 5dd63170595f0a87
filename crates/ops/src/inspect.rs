//! The inspect process: a readable dump of the tier catalogue, grouped
//! unit type → tier → feature. The automatic `meta:active` feature is
//! elided, and with it any `meta` tier it leaves empty.

use crate::Result;
use corpus::{Store, ValueType};
use std::collections::BTreeMap;
use std::fmt::Write;

pub fn schema_summary(store: &Store) -> Result<String> {
    let mut grouped: BTreeMap<String, BTreeMap<String, Vec<(String, ValueType)>>> =
        BTreeMap::new();
    for def in store.get_all_features()? {
        grouped
            .entry(def.unittype)
            .or_default()
            .entry(def.tier)
            .or_default()
            .push((def.feature, def.valuetype));
    }
    let mut out = String::new();
    for (unittype, tiers) in &grouped {
        out.push_str(unittype);
        out.push('\n');
        for (tier, features) in tiers {
            if tier == "meta" && features.len() == 1 {
                continue;
            }
            writeln!(out, "\t{}", tier).unwrap();
            for (feature, valuetype) in features {
                if tier == "meta" && feature == "active" {
                    continue;
                }
                writeln!(out, "\t\t{}: {}", feature, valuetype).unwrap();
            }
        }
        out.push('\n');
    }
    Ok(out)
}
