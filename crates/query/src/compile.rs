//! Compilation of a [`Query`] into a single relational selection: one row
//! per candidate assignment of unit variables. Unit variables become aliases
//! of the units table (`TU{i}`), feature references become aliases of the
//! features table (`F{n}`), and top-level parent/child clauses become aliases
//! of the relations table (`R{n}`). Existence tests and nested graph
//! predicates compile to correlated EXISTS subqueries instead.

use crate::ast::{BinOp, Expr, Query};
use crate::{Error, Result};
use corpus::{Mapping, Store, Value, ValueType};
use indexmap::IndexMap;
use itertools::Itertools;
use rusqlite::types::Value as SqlValue;

/// A compiled selection. When built `anchored`, the SQL takes one trailing
/// parameter binding the anchor unit's id (subquery execution).
pub(crate) struct Plan {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

struct FeatureAlias {
    n: usize,
    unit: usize,
    fids: Vec<i64>,
    is_str: bool,
}

struct Frag {
    sql: String,
    is_str: bool,
}

struct Compiler<'a> {
    store: &'a Store,
    mapping: &'a Mapping,
    query: &'a Query,
    feature_aliases: IndexMap<(usize, String), FeatureAlias>,
    relation_count: usize,
    params: Vec<SqlValue>,
}

fn ids_csv(ids: &[i64]) -> String {
    ids.iter().map(|id| id.to_string()).join(", ")
}

fn escape_like(pattern: &str) -> String {
    pattern
        .replace('$', "$$")
        .replace('%', "$%")
        .replace('_', "$_")
}

impl<'a> Compiler<'a> {
    /// Feature ids and string-ness of a feature reference, after mapping.
    /// Disjunctive unit types may resolve to several definitions; string-ness
    /// is then the disjunction over them.
    fn resolve_feature(&self, unit: usize, feature: &str) -> Result<(Vec<i64>, bool)> {
        let var = &self.query.units[unit];
        let stored_types = self.mapping.map_types(&var.types);
        let stored_feature = self.mapping.map_feature(feature, &var.types);
        let defs = self
            .store
            .get_feature_multi_type(&stored_types, &stored_feature)?;
        if defs.is_empty() {
            return Err(Error::UnknownFeature {
                feature: feature.to_string(),
                unittypes: var.types.clone(),
            });
        }
        let is_str = defs.iter().any(|(_, vt)| *vt == ValueType::Str);
        Ok((defs.iter().map(|(id, _)| *id).collect(), is_str))
    }

    fn feature_alias(&mut self, unit: usize, feature: &str) -> Result<(usize, bool)> {
        if let Some(alias) = self.feature_aliases.get(&(unit, feature.to_string())) {
            return Ok((alias.n, alias.is_str));
        }
        let (fids, is_str) = self.resolve_feature(unit, feature)?;
        let n = self.feature_aliases.len();
        self.feature_aliases.insert(
            (unit, feature.to_string()),
            FeatureAlias {
                n,
                unit,
                fids,
                is_str,
            },
        );
        Ok((n, is_str))
    }

    /// Render an expression to a SQL fragment. `top` is true only along the
    /// conjunctive spine of a clause, where a graph predicate may claim a
    /// relation alias; anywhere else it must fall back to EXISTS.
    fn render(&mut self, expr: &Expr, top: bool) -> Result<Frag> {
        match expr {
            Expr::Literal(value) => {
                self.params.push(value.to_sql_value());
                Ok(Frag {
                    sql: "?".to_string(),
                    is_str: matches!(value, Value::Str(_)),
                })
            }
            Expr::Unit(unit) => Ok(Frag {
                sql: format!("TU{}.id", unit),
                is_str: false,
            }),
            Expr::Feature { unit, feature } => {
                let (n, is_str) = self.feature_alias(*unit, feature)?;
                Ok(Frag {
                    sql: format!("F{}.value", n),
                    is_str,
                })
            }
            Expr::Exists { unit, feature } => {
                let (fids, _) = self.resolve_feature(*unit, feature)?;
                Ok(Frag {
                    sql: format!(
                        "EXISTS (SELECT 1 FROM features WHERE unit = TU{}.id AND feature IN ({}))",
                        unit,
                        ids_csv(&fids)
                    ),
                    is_str: false,
                })
            }
            Expr::Not(inner) => {
                let frag = self.render(inner, false)?;
                Ok(Frag {
                    sql: format!("NOT ({})", frag.sql),
                    is_str: false,
                })
            }
            Expr::Binary { op, left, right } => self.render_binary(*op, left, right, top),
        }
    }

    fn render_binary(&mut self, op: BinOp, left: &Expr, right: &Expr, top: bool) -> Result<Frag> {
        match op {
            BinOp::And | BinOp::Or => {
                let keep_top = top && op == BinOp::And;
                let l = self.render(left, keep_top)?;
                let r = self.render(right, keep_top)?;
                let word = if op == BinOp::And { "AND" } else { "OR" };
                Ok(Frag {
                    sql: format!("({} {} {})", l.sql, word, r.sql),
                    is_str: false,
                })
            }
            BinOp::Parent | BinOp::Child => self.render_relation(op, left, right, top),
            BinOp::Add => {
                let l = self.render(left, false)?;
                let r = self.render(right, false)?;
                if l.is_str || r.is_str {
                    Ok(Frag {
                        sql: format!("({} || {})", l.sql, r.sql),
                        is_str: true,
                    })
                } else {
                    Ok(Frag {
                        sql: format!("({} + {})", l.sql, r.sql),
                        is_str: false,
                    })
                }
            }
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                let symbol = match op {
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    _ => "%",
                };
                let l = self.render(left, false)?;
                let r = self.render(right, false)?;
                Ok(Frag {
                    sql: format!("({} {} {})", l.sql, symbol, r.sql),
                    is_str: false,
                })
            }
            BinOp::StartsWith | BinOp::EndsWith | BinOp::Contains => {
                self.render_string_match(op, left, right)
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                let symbol = match op {
                    BinOp::Lt => "<",
                    BinOp::Le => "<=",
                    BinOp::Gt => ">",
                    BinOp::Ge => ">=",
                    BinOp::Eq => "=",
                    _ => "!=",
                };
                let l = self.render(left, false)?;
                let r = self.render(right, false)?;
                Ok(Frag {
                    sql: format!("({} {} {})", l.sql, symbol, r.sql),
                    is_str: false,
                })
            }
        }
    }

    /// `a parent b` probes active primary relations with child a and parent
    /// b; `a child b` probes active secondary relations with parent a and
    /// child b.
    fn render_relation(&mut self, op: BinOp, left: &Expr, right: &Expr, top: bool) -> Result<Frag> {
        let (a, b) = match (left, right) {
            (Expr::Unit(a), Expr::Unit(b)) => (*a, *b),
            _ => {
                return Err(Error::GraphOperandNotUnit {
                    op: if op == BinOp::Parent { "parent" } else { "child" },
                })
            }
        };
        let (child, parent, isprimary) = match op {
            BinOp::Parent => (a, b, 1),
            _ => (b, a, 0),
        };
        if top {
            let n = self.relation_count;
            self.relation_count += 1;
            Ok(Frag {
                sql: format!(
                    "(R{n}.child = TU{child}.id AND R{n}.parent = TU{parent}.id \
                     AND R{n}.isprimary = {isprimary} AND R{n}.active = 1)",
                    n = n,
                    child = child,
                    parent = parent,
                    isprimary = isprimary
                ),
                is_str: false,
            })
        } else {
            Ok(Frag {
                sql: format!(
                    "EXISTS (SELECT 1 FROM relations WHERE child = TU{}.id \
                     AND parent = TU{}.id AND isprimary = {} AND active = 1)",
                    child, parent, isprimary
                ),
                is_str: false,
            })
        }
    }

    fn render_string_match(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<Frag> {
        if let Expr::Literal(Value::Str(pattern)) = right {
            let escaped = escape_like(pattern);
            let pattern = match op {
                BinOp::StartsWith => format!("{}%", escaped),
                BinOp::EndsWith => format!("%{}", escaped),
                _ => format!("%{}%", escaped),
            };
            let l = self.render(left, false)?;
            self.params.push(SqlValue::Text(pattern));
            return Ok(Frag {
                sql: format!("({} LIKE ? ESCAPE '$')", l.sql),
                is_str: false,
            });
        }
        // Computed patterns cannot be LIKE-escaped; match on the raw text.
        let l = self.render(left, false)?;
        let sql = match op {
            BinOp::StartsWith => {
                let r1 = self.render(right, false)?;
                let r2 = self.render(right, false)?;
                format!("(substr({}, 1, length({})) = {})", l.sql, r1.sql, r2.sql)
            }
            BinOp::EndsWith => {
                let r1 = self.render(right, false)?;
                let r2 = self.render(right, false)?;
                format!("(substr({}, -length({})) = {})", l.sql, r1.sql, r2.sql)
            }
            _ => {
                let r = self.render(right, false)?;
                format!("(instr({}, {}) > 0)", l.sql, r.sql)
            }
        };
        Ok(Frag { sql, is_str: false })
    }
}

pub(crate) fn compile(
    store: &Store,
    mapping: &Mapping,
    query: &Query,
    anchored: bool,
) -> Result<Plan> {
    let mut compiler = Compiler {
        store,
        mapping,
        query,
        feature_aliases: IndexMap::new(),
        relation_count: 0,
        params: Vec::new(),
    };
    let mut conjuncts: Vec<String> = Vec::new();

    for (i, unit) in query.units.iter().enumerate() {
        let stored_types = mapping.map_types(&unit.types);
        for (stored, source) in stored_types.iter().zip(unit.types.iter()) {
            if !store.type_exists(stored)? {
                return Err(Error::UnknownUnitType(source.clone()));
            }
        }
        if stored_types.len() == 1 {
            conjuncts.push(format!("TU{}.type = ?", i));
        } else {
            conjuncts.push(format!(
                "TU{}.type IN ({})",
                i,
                vec!["?"; stored_types.len()].join(", ")
            ));
        }
        compiler
            .params
            .extend(stored_types.into_iter().map(SqlValue::Text));
    }

    for condition in &query.conditions {
        let frag = compiler.render(condition, true)?;
        conjuncts.push(frag.sql);
    }

    for alias in compiler.feature_aliases.values() {
        conjuncts.push(format!("F{}.unit = TU{}.id", alias.n, alias.unit));
        conjuncts.push(format!("F{}.feature IN ({})", alias.n, ids_csv(&alias.fids)));
    }

    if anchored {
        conjuncts.push("TU0.id = ?".to_string());
    }

    let select = (0..query.units.len())
        .map(|i| format!("TU{}.id AS U{}", i, i))
        .join(", ");
    let mut from: Vec<String> = (0..query.units.len())
        .map(|i| format!("units TU{}", i))
        .collect();
    from.extend(
        compiler
            .feature_aliases
            .values()
            .map(|alias| format!("features F{}", alias.n)),
    );
    from.extend((0..compiler.relation_count).map(|n| format!("relations R{}", n)));

    let mut sql = format!("SELECT {} FROM {}", select, from.join(", "));
    if !conjuncts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conjuncts.join(" AND "));
    }
    Ok(Plan {
        sql,
        params: compiler.params,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ast::Expr;

    #[test]
    fn like_patterns_escape_their_wildcards() {
        assert_eq!(escape_like("50%_done$"), "50$%$_done$$");
    }

    fn fixture() -> Store {
        let store = corpus::create(":memory:").unwrap();
        store.ensure_type("word").unwrap();
        store
            .create_feature("word", "UD:lemma", ValueType::Str)
            .unwrap();
        store
            .create_feature("word", "meta:index", ValueType::Int)
            .unwrap();
        store
    }

    #[test]
    fn plans_select_one_column_per_unit() {
        let store = fixture();
        let mut query = Query::new();
        query.add_unit("A", vec!["word".to_string()], None);
        query.add_unit("B", vec!["word".to_string()], None);
        query.add_condition(Expr::parent(1, 0));
        let plan = compile(&store, &Mapping::default(), &query, false).unwrap();
        assert!(plan.sql.starts_with("SELECT TU0.id AS U0, TU1.id AS U1 FROM"));
        assert!(plan.sql.contains("units TU0"));
        assert!(plan.sql.contains("units TU1"));
        assert!(plan.sql.contains("relations R0"));
        assert!(plan.sql.contains("R0.isprimary = 1"));
        // Two implicit meta:active references, one per unit.
        assert!(plan.sql.contains("features F0"));
        assert!(plan.sql.contains("features F1"));
    }

    #[test]
    fn unknown_features_and_types_fail_to_compile() {
        let store = fixture();
        let mut query = Query::new();
        query.add_unit("A", vec!["word".to_string()], None);
        query.add_condition(Expr::feature(0, "no:such").eq(Expr::literal(1)));
        assert!(matches!(
            compile(&store, &Mapping::default(), &query, false),
            Err(Error::UnknownFeature { .. })
        ));

        let mut query = Query::new();
        query.add_unit("A", vec!["verse".to_string()], None);
        assert!(matches!(
            compile(&store, &Mapping::default(), &query, false),
            Err(Error::UnknownUnitType(t)) if t == "verse"
        ));
    }

    #[test]
    fn nested_graph_predicates_use_exists() {
        let store = fixture();
        let mut query = Query::new();
        query.add_unit("A", vec!["word".to_string()], None);
        query.add_unit("B", vec!["word".to_string()], None);
        query.add_condition(Expr::parent(0, 1).not_());
        let plan = compile(&store, &Mapping::default(), &query, false).unwrap();
        assert!(plan.sql.contains("NOT (EXISTS (SELECT 1 FROM relations"));
        assert!(!plan.sql.contains("relations R0"));
    }
}
