//! Query execution: run the compiled selection, deduplicate candidate
//! tuples, collapse the multi-node into a list binding, filter by subquery
//! counts, and order the results.

use crate::ast::Query;
use crate::compile::compile;
use crate::{Error, Result};
use corpus::{Mapping, Store, Value};
use indexmap::IndexMap;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// A unit variable's binding in one match: a single id, or the collapsed
/// list of a multi-node or subquery attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    One(i64),
    Many(Vec<i64>),
}

impl Binding {
    pub fn ids(&self) -> &[i64] {
        match self {
            Binding::One(id) => std::slice::from_ref(id),
            Binding::Many(ids) => ids,
        }
    }

    pub fn one(&self) -> Option<i64> {
        match self {
            Binding::One(id) => Some(*id),
            Binding::Many(_) => None,
        }
    }
}

/// One assignment of unit variables, in declaration order, with subquery
/// attachments after them.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub bindings: IndexMap<String, Binding>,
}

impl Match {
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }
}

/// The materialised result sequence: finite, deterministic, single-pass.
pub struct Matches {
    inner: std::vec::IntoIter<Match>,
}

impl Iterator for Matches {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        self.inner.next()
    }
}

impl ExactSizeIterator for Matches {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

fn value_rank(value: &Value) -> u8 {
    match value {
        Value::Bool(_) => 0,
        Value::Int(_) => 1,
        Value::Str(_) => 2,
    }
}

fn cmp_value(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => value_rank(a).cmp(&value_rank(b)),
    }
}

/// Present order values sort before absent ones; ties fall through.
fn cmp_order_key(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp_value(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Search the store for every assignment matching `query`. Results are
/// ordered by the units' `order` features (lexicographically, in unit
/// declaration order), then by ascending ids.
pub fn search(store: &Store, mapping: &Mapping, query: &Query) -> Result<Matches> {
    let matches = run(store, mapping, query, None)?;
    Ok(Matches {
        inner: matches.into_iter(),
    })
}

fn run(
    store: &Store,
    mapping: &Mapping,
    query: &Query,
    anchor: Option<i64>,
) -> Result<Vec<Match>> {
    let plan = compile(store, mapping, query, anchor.is_some())?;
    tracing::debug!(sql = %plan.sql, "compiled selection");
    let width = query.units.len();

    let mut params = plan.params;
    if let Some(anchor) = anchor {
        params.push(SqlValue::Integer(anchor));
    }
    let mut stmt = store.connection().prepare(&plan.sql)?;
    let rows = stmt.query_map(params_from_iter(params), |r| {
        let mut row = Vec::with_capacity(width);
        for i in 0..width {
            row.push(r.get::<_, i64>(i)?);
        }
        Ok(row)
    })?;

    let mut seen: HashSet<Vec<i64>> = HashSet::new();
    let mut tuples: Vec<Vec<i64>> = Vec::new();
    for row in rows {
        let row = row.map_err(corpus::Error::from)?;
        if seen.insert(row.clone()) {
            tuples.push(row);
        }
    }

    // Collapse the multi-node: one output tuple per assignment of the other
    // units, with the multi unit's candidates gathered into a list.
    let mut grouped: Vec<(Vec<i64>, Vec<i64>)> = Vec::new();
    match query.multiple {
        None => {
            grouped = tuples.into_iter().map(|row| (row, Vec::new())).collect();
        }
        Some(multi) => {
            let mut index: IndexMap<Vec<i64>, Vec<i64>> = IndexMap::new();
            for row in tuples {
                let mut key = row.clone();
                let id = key.remove(multi);
                let entry = index.entry(key).or_default();
                if !entry.contains(&id) {
                    entry.push(id);
                }
            }
            for (key, many) in index {
                let mut row = key;
                row.insert(multi, 0);
                grouped.push((row, many));
            }
        }
    }

    // Order-feature values, fetched per ordered unit over the ids that
    // actually occur in the result set.
    let mut order_values: HashMap<usize, HashMap<i64, Value>> = HashMap::new();
    for (i, unit) in query.units.iter().enumerate() {
        let feature = match &unit.order {
            Some(feature) => feature,
            None => continue,
        };
        let stored_types = mapping.map_types(&unit.types);
        let stored_feature = mapping.map_feature(feature, &unit.types);
        let defs = store.get_feature_multi_type(&stored_types, &stored_feature)?;
        if defs.is_empty() {
            return Err(Error::UnknownFeature {
                feature: feature.clone(),
                unittypes: unit.types.clone(),
            });
        }
        let kinds: HashSet<_> = defs.iter().map(|(_, vt)| *vt).collect();
        if kinds.len() > 1 {
            return Err(Error::MixedOrderTypes {
                unit: unit.name.clone(),
                feature: feature.clone(),
            });
        }
        let fids: Vec<i64> = defs.iter().map(|(id, _)| *id).collect();
        let mut ids: Vec<i64> = Vec::new();
        for (row, many) in &grouped {
            if Some(i) == query.multiple {
                ids.extend(many.iter().copied());
            } else {
                ids.push(row[i]);
            }
        }
        ids.sort_unstable();
        ids.dedup();
        order_values.insert(i, store.get_feature_values(&ids, &fids)?);
    }

    // Sort each multi list by its own order feature, then ids.
    if let Some(multi) = query.multiple {
        let values = order_values.get(&multi);
        for (_, many) in grouped.iter_mut() {
            many.sort_by(|a, b| match values {
                Some(values) => {
                    cmp_order_key(values.get(a), values.get(b)).then_with(|| a.cmp(b))
                }
                None => a.cmp(b),
            });
        }
    }

    grouped.sort_by(|(row_a, _), (row_b, _)| {
        for (i, _) in query.units.iter().enumerate() {
            if Some(i) == query.multiple {
                continue;
            }
            if let Some(values) = order_values.get(&i) {
                let ord = cmp_order_key(values.get(&row_a[i]), values.get(&row_b[i]));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
        row_a.cmp(row_b)
    });

    let mut matches = Vec::with_capacity(grouped.len());
    'tuples: for (row, many) in grouped {
        let mut bindings = IndexMap::with_capacity(width + query.subqueries.len());
        for (i, unit) in query.units.iter().enumerate() {
            if Some(i) == query.multiple {
                bindings.insert(unit.name.clone(), Binding::Many(many.clone()));
            } else {
                bindings.insert(unit.name.clone(), Binding::One(row[i]));
            }
        }
        for sub in &query.subqueries {
            let anchor_id = row[sub.anchor];
            let inner = run(store, mapping, &sub.query, Some(anchor_id))?;
            let count = inner.len();
            if count < sub.min || sub.max.map_or(false, |max| count > max) {
                continue 'tuples;
            }
            // Attach the inner pattern's first non-anchor unit.
            let mut attached: Vec<i64> = Vec::new();
            if let Some(inner_unit) = sub.query.units.get(1) {
                for m in &inner {
                    for id in m.bindings[&inner_unit.name].ids() {
                        if !attached.contains(id) {
                            attached.push(*id);
                        }
                    }
                }
            }
            bindings.insert(sub.key.clone(), Binding::Many(attached));
        }
        matches.push(Match { bindings });
    }
    Ok(matches)
}
