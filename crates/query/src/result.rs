//! Binding query results to feature projections. A `ResultTable` executes
//! its query up front and then fills a per-tuple feature cache on demand:
//! by explicit feature list, by tier, or by fetching children of a bound
//! unit. Writers drain it tuple-by-tuple.

use crate::ast::Query;
use crate::exec::{search, Binding};
use crate::{Error, Result};
use corpus::{join_feature, split_feature, Mapping, Store, Value, ValueType};
use indexmap::IndexMap;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use std::collections::{HashMap, HashSet};

/// (out-facing name, feature id, value type) for one resolvable definition.
type FeatureSpec = (String, i64, ValueType);

pub struct ResultTable<'a> {
    store: &'a Store,
    mapping: Mapping,
    inverse: Mapping,
    nodes: Vec<IndexMap<String, Binding>>,
    /// Per-tuple cache: unit id → feature name → value.
    features: Vec<HashMap<i64, HashMap<String, Value>>>,
    /// Node name → declared (source-vocabulary) types.
    types: HashMap<String, Vec<String>>,
    /// Unit id → indices of the tuples it occurs in.
    unit2results: HashMap<i64, Vec<usize>>,
}

impl<'a> ResultTable<'a> {
    /// Execute `query` against the store and index its matches. The mapping
    /// translates the query's vocabulary on the way in and feature names on
    /// the way back out.
    pub fn new(store: &'a Store, query: &Query, mapping: Mapping) -> Result<ResultTable<'a>> {
        let nodes: Vec<IndexMap<String, Binding>> =
            search(store, &mapping, query)?.map(|m| m.bindings).collect();
        let mut features = Vec::with_capacity(nodes.len());
        let mut unit2results: HashMap<i64, Vec<usize>> = HashMap::new();
        for (index, bindings) in nodes.iter().enumerate() {
            let mut cache: HashMap<i64, HashMap<String, Value>> = HashMap::new();
            for binding in bindings.values() {
                for id in binding.ids() {
                    cache.entry(*id).or_default();
                    unit2results.entry(*id).or_default().push(index);
                }
            }
            features.push(cache);
        }
        let types = query
            .units
            .iter()
            .map(|u| (u.name.clone(), u.types.clone()))
            .collect();
        let inverse = mapping.invert();
        Ok(ResultTable {
            store,
            mapping,
            inverse,
            nodes,
            features,
            types,
            unit2results,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A unit's type in the mapping's outward vocabulary.
    pub fn get_type(&self, unit: i64) -> Result<String> {
        let stored = self.store.get_unit_type(unit)?;
        Ok(self.inverse.map_type(&stored))
    }

    fn node_types(&self, node: &str) -> Result<&Vec<String>> {
        self.types
            .get(node)
            .ok_or_else(|| Error::UnknownUnit(node.to_string()))
    }

    fn node_ids(&self, node: &str) -> Vec<i64> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for bindings in &self.nodes {
            if let Some(binding) = bindings.get(node) {
                for id in binding.ids() {
                    if seen.insert(*id) {
                        out.push(*id);
                    }
                }
            }
        }
        out
    }

    /// Resolve feature names for `node` and pull their values into the
    /// per-tuple cache. With `map_features`, names pass through the mapping
    /// before resolution and are cached under their given (outward) form.
    /// Unknown features error unless `must_exist` is false, in which case
    /// they are skipped. Returns the names that resolved.
    pub fn add_features(
        &mut self,
        node: &str,
        features: &[String],
        map_features: bool,
        must_exist: bool,
    ) -> Result<Vec<String>> {
        let source_types = self.node_types(node)?.clone();
        let stored_types = self.mapping.map_types(&source_types);
        let mut specs: Vec<FeatureSpec> = Vec::new();
        for name in features {
            let stored = if map_features {
                self.mapping.map_feature(name, &source_types)
            } else {
                name.clone()
            };
            let defs = self.store.get_feature_multi_type(&stored_types, &stored)?;
            if defs.is_empty() {
                if must_exist {
                    return Err(Error::UnknownFeature {
                        feature: name.clone(),
                        unittypes: source_types,
                    });
                }
                continue;
            }
            for (fid, valuetype) in defs {
                specs.push((name.clone(), fid, valuetype));
            }
        }
        self.fetch(node, specs)
    }

    /// Pull every feature of `node`'s type whose tier equals `tier` (or
    /// starts with it, under `prefix`). Mapped features surface under their
    /// outward names; stored features claimed by a mapping entry are skipped
    /// so nothing is listed twice.
    pub fn add_tier(&mut self, node: &str, tier: &str, prefix: bool) -> Result<Vec<String>> {
        let source_types = self.node_types(node)?.clone();
        let stored_types = self.mapping.map_types(&source_types);
        let matches = |t: &str| {
            if prefix {
                t.starts_with(tier)
            } else {
                t == tier
            }
        };

        let mut specs: Vec<FeatureSpec> = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();
        for ((source_feat, source_type), (stored_feat, _)) in self.mapping.feature_entries() {
            if let Some(t) = source_type {
                if !source_types.contains(t) {
                    continue;
                }
            }
            let (source_tier, _) = split_feature(source_feat)?;
            if matches(source_tier) {
                for (fid, valuetype) in self
                    .store
                    .get_feature_multi_type(&stored_types, stored_feat)?
                {
                    specs.push((source_feat.clone(), fid, valuetype));
                }
            }
            let (stored_tier, _) = split_feature(stored_feat)?;
            if matches(stored_tier) {
                claimed.insert(stored_feat.clone());
            }
        }

        for def in self.store.get_all_features()? {
            if !stored_types.contains(&def.unittype) || !matches(&def.tier) {
                continue;
            }
            let name = join_feature(&def.tier, &def.feature);
            if claimed.contains(&name) {
                continue;
            }
            specs.push((name, def.id, def.valuetype));
        }
        self.fetch(node, specs)
    }

    /// Fetch the primary children (of `child_type`, in the outward
    /// vocabulary) of every unit bound under `node` and bind them beneath a
    /// fresh synthetic node name. Returns the name, or None when there are
    /// no result tuples to extend.
    pub fn add_children(&mut self, node: &str, child_type: &str) -> Result<Option<String>> {
        if self.nodes.is_empty() {
            return Ok(None);
        }
        self.node_types(node)?;
        let stored_child = self.mapping.map_type(child_type);
        let parents = self.node_ids(node);
        let children = self.store.get_children(&parents, &stored_child)?;
        let mut name = format!("{}_children", node);
        while self.nodes[0].contains_key(&name) {
            name.push('*');
        }
        for (index, bindings) in self.nodes.iter_mut().enumerate() {
            let bound: Vec<i64> = match bindings.get(node) {
                Some(binding) => binding.ids().to_vec(),
                None => Vec::new(),
            };
            let mut kids: Vec<i64> = Vec::new();
            for parent in bound {
                if let Some(found) = children.get(&parent) {
                    kids.extend(found.iter().copied());
                }
            }
            for kid in &kids {
                self.features[index].entry(*kid).or_default();
                self.unit2results.entry(*kid).or_default().push(index);
            }
            bindings.insert(name.clone(), Binding::Many(kids));
        }
        self.types
            .insert(name.clone(), vec![child_type.to_string()]);
        Ok(Some(name))
    }

    fn fetch(&mut self, node: &str, specs: Vec<FeatureSpec>) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for (name, _, _) in &specs {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        let units = self.node_ids(node);
        if units.is_empty() || specs.is_empty() {
            return Ok(names);
        }
        let by_fid: HashMap<i64, (String, ValueType)> = specs
            .iter()
            .map(|(name, fid, valuetype)| (*fid, (name.clone(), *valuetype)))
            .collect();
        let sql = format!(
            "SELECT unit, feature, value FROM features
             WHERE unit IN ({}) AND feature IN ({})",
            vec!["?"; units.len()].join(", "),
            vec!["?"; by_fid.len()].join(", ")
        );
        let mut params: Vec<SqlValue> = units.iter().map(|u| SqlValue::Integer(*u)).collect();
        params.extend(by_fid.keys().map(|f| SqlValue::Integer(*f)));
        let mut stmt = self.store.connection().prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, SqlValue>(2)?,
                ))
            })
            .map_err(corpus::Error::from)?;
        for row in rows {
            let (unit, fid, raw) = row.map_err(corpus::Error::from)?;
            let (name, valuetype) = &by_fid[&fid];
            let value = match Value::decode(raw, name, *valuetype).map_err(corpus::Error::from)? {
                Some(value) => value,
                None => continue,
            };
            if let Some(indices) = self.unit2results.get(&unit) {
                for &index in indices {
                    let in_node = self.nodes[index]
                        .get(node)
                        .map_or(false, |b| b.ids().contains(&unit));
                    if in_node {
                        self.features[index]
                            .entry(unit)
                            .or_default()
                            .insert(name.clone(), value.clone());
                    }
                }
            }
        }
        Ok(names)
    }

    /// Iterate `(bindings, per-unit feature cache)` pairs, one per match.
    /// Single-pass consumers should materialise if they need to traverse
    /// twice.
    pub fn results(
        &self,
    ) -> impl Iterator<Item = (&IndexMap<String, Binding>, &HashMap<i64, HashMap<String, Value>>)>
    {
        self.nodes.iter().zip(self.features.iter())
    }
}
