//! The boundary form of a query: an ordered mapping of unit names to
//! declarations, deserialized from a configuration document and lowered onto
//! the AST builders.

use crate::ast::{Expr, Query, Subquery};
use crate::{Error, Result};
use corpus::Value;
use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    One(String),
    Many(Vec<String>),
}

impl TypeSpec {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            TypeSpec::One(t) => vec![t.clone()],
            TypeSpec::Many(ts) => ts.clone(),
        }
    }
}

/// One feature constraint. At most one of the operator fields may be given;
/// a bare `feature` only requires existence through its value join.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureCondition {
    pub feature: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub startswith: Option<String>,
    #[serde(default)]
    pub endswith: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub exists: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubquerySpec {
    #[serde(default)]
    pub min: usize,
    #[serde(default)]
    pub max: Option<usize>,
    pub units: IndexMap<String, UnitSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
    #[serde(rename = "type")]
    pub unittype: TypeSpec,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub features: Vec<FeatureCondition>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub subqueries: Vec<SubquerySpec>,
    /// Features the query process renders per match; not a constraint.
    #[serde(default)]
    pub print: Vec<String>,
}

pub type QuerySpec = IndexMap<String, UnitSpec>;

fn feature_condition(unit: usize, spec: &FeatureCondition) -> Result<Expr> {
    let mut constraints: Vec<Expr> = Vec::new();
    let access = || Expr::feature(unit, spec.feature.as_str());
    if let Some(value) = &spec.value {
        constraints.push(access().eq(Expr::Literal(value.clone())));
    }
    if let Some(prefix) = &spec.startswith {
        constraints.push(access().startswith(Expr::literal(prefix.as_str())));
    }
    if let Some(suffix) = &spec.endswith {
        constraints.push(access().endswith(Expr::literal(suffix.as_str())));
    }
    if let Some(text) = &spec.contains {
        constraints.push(access().contains_(Expr::literal(text.as_str())));
    }
    if let Some(exists) = spec.exists {
        let probe = Expr::exists(unit, spec.feature.as_str());
        constraints.push(if exists { probe } else { probe.not_() });
    }
    match constraints.len() {
        0 => Ok(Expr::exists(unit, spec.feature.as_str())),
        1 => Ok(constraints.pop().unwrap()),
        _ => Err(Error::InvalidSpec(format!(
            "feature '{}' carries more than one constraint",
            spec.feature
        ))),
    }
}

fn build_into(query: &mut Query, spec: &QuerySpec) -> Result<()> {
    let base = query.units.len();
    for (name, unit) in spec {
        let index = query.add_unit(name.clone(), unit.unittype.to_vec(), unit.order.clone());
        if unit.multiple {
            if let Some(previous) = query.multiple {
                return Err(Error::MultipleMultiNodes(
                    query.units[previous].name.clone(),
                    name.clone(),
                ));
            }
            query.multiple = Some(index);
        }
    }
    for (offset, (name, unit)) in spec.iter().enumerate() {
        let index = base + offset;
        for condition in &unit.features {
            query.add_condition(feature_condition(index, condition)?);
        }
        if let Some(parent) = &unit.parent {
            let parent_index = query
                .unit_index(parent)
                .ok_or_else(|| Error::UnknownUnit(parent.clone()))?;
            if Some(parent_index) == query.multiple {
                return Err(Error::MultiNodeParent(parent.clone()));
            }
            query.add_condition(Expr::parent(index, parent_index));
        }
        if let Some(next) = &unit.next {
            let next_index = query
                .unit_index(next)
                .ok_or_else(|| Error::UnknownUnit(next.clone()))?;
            if query.units[next_index].types != query.units[index].types {
                return Err(Error::AdjacencyTypeMismatch {
                    left: name.clone(),
                    right: next.clone(),
                });
            }
            query.add_condition(
                Expr::feature(index, "meta:index")
                    .plus(Expr::literal(1))
                    .eq(Expr::feature(next_index, "meta:index")),
            );
        }
        if unit.multiple && !unit.subqueries.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "multi-node '{}' cannot anchor subqueries",
                name
            )));
        }
        for (i, sub) in unit.subqueries.iter().enumerate() {
            let mut inner = Query::new();
            // The anchor re-quantifies as the inner pattern's first unit.
            inner.add_unit(name.clone(), unit.unittype.to_vec(), None);
            build_into(&mut inner, &sub.units)?;
            query.subqueries.push(Subquery {
                anchor: index,
                key: format!("{}_sub{}", name, i),
                min: sub.min,
                max: sub.max,
                query: inner,
            });
        }
    }
    Ok(())
}

/// Lower a boundary query specifier into a [`Query`].
pub fn build_query(spec: &QuerySpec) -> Result<Query> {
    if spec.is_empty() {
        return Err(Error::InvalidSpec("query declares no units".to_string()));
    }
    let mut query = Query::new();
    build_into(&mut query, spec)?;
    Ok(query)
}
