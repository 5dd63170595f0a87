//! The query pattern language: typed unit variables plus condition trees.
//! Conditions never hold pointers back into the query; they reference units
//! by index into the query's unit table.

use corpus::Value;

/// A typed variable of the pattern. `index` is the unit's position in the
/// owning [`Query`] and doubles as its alias key in the compiled selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub name: String,
    /// One or more acceptable unit types (a disjunction when several).
    pub types: Vec<String>,
    pub index: usize,
    /// Feature to sort this variable's bindings by.
    pub order: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    StartsWith,
    EndsWith,
    Contains,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    /// `a parent b`: b is a's active primary parent.
    Parent,
    /// `a child b`: b hangs off a through an active secondary relation.
    Child,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A unit variable, evaluating to its id.
    Unit(usize),
    /// The stored value of a feature on a unit variable.
    Feature { unit: usize, feature: String },
    /// True iff any authoritative row exists for the feature.
    Exists { unit: usize, feature: String },
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn unit(index: usize) -> Expr {
        Expr::Unit(index)
    }

    pub fn feature(unit: usize, feature: impl Into<String>) -> Expr {
        Expr::Feature {
            unit,
            feature: feature.into(),
        }
    }

    pub fn exists(unit: usize, feature: impl Into<String>) -> Expr {
        Expr::Exists {
            unit,
            feature: feature.into(),
        }
    }

    pub fn parent(child: usize, parent: usize) -> Expr {
        Expr::Unit(child).binary(BinOp::Parent, Expr::Unit(parent))
    }

    pub fn child(parent: usize, child: usize) -> Expr {
        Expr::Unit(parent).binary(BinOp::Child, Expr::Unit(child))
    }

    fn binary(self, op: BinOp, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }

    pub fn eq(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Eq, rhs)
    }

    pub fn ne(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Ne, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Lt, rhs)
    }

    pub fn le(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Le, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Gt, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Ge, rhs)
    }

    pub fn plus(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Add, rhs)
    }

    pub fn minus(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Sub, rhs)
    }

    pub fn times(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Mul, rhs)
    }

    pub fn div(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Div, rhs)
    }

    pub fn rem(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Rem, rhs)
    }

    pub fn startswith(self, rhs: Expr) -> Expr {
        self.binary(BinOp::StartsWith, rhs)
    }

    pub fn endswith(self, rhs: Expr) -> Expr {
        self.binary(BinOp::EndsWith, rhs)
    }

    pub fn contains_(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Contains, rhs)
    }

    pub fn and_(self, rhs: Expr) -> Expr {
        self.binary(BinOp::And, rhs)
    }

    pub fn or_(self, rhs: Expr) -> Expr {
        self.binary(BinOp::Or, rhs)
    }

    pub fn not_(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Split a top-level AND chain into independent clauses. The planner
    /// treats each clause as one WHERE conjunct.
    pub fn flatten(self) -> Vec<Expr> {
        match self {
            Expr::Binary {
                op: BinOp::And,
                left,
                right,
            } => {
                let mut out = left.flatten();
                out.extend(right.flatten());
                out
            }
            other => vec![other],
        }
    }
}

/// A bounded inner pattern anchored on one of the outer query's units.
/// Executed once per outer match; the outer match survives only if the inner
/// result count lands in `[min, max]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    pub anchor: usize,
    /// Synthetic binding name the inner results attach under.
    pub key: String,
    pub min: usize,
    pub max: Option<usize>,
    pub query: Query,
}

/// A pattern over the annotation graph. Owns its units; conditions and
/// subqueries refer to them by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub units: Vec<Unit>,
    pub conditions: Vec<Expr>,
    pub subqueries: Vec<Subquery>,
    /// Index of the unit whose bindings collapse into one list per match.
    pub multiple: Option<usize>,
}

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    /// Register a unit variable. Every unit implicitly requires
    /// `meta:active = true`.
    pub fn add_unit(
        &mut self,
        name: impl Into<String>,
        types: Vec<String>,
        order: Option<String>,
    ) -> usize {
        let index = self.units.len();
        self.units.push(Unit {
            name: name.into(),
            types,
            index,
            order,
        });
        self.conditions
            .push(Expr::feature(index, "meta:active").eq(Expr::literal(true)));
        index
    }

    /// Add a condition, splitting top-level conjunctions into clauses.
    pub fn add_condition(&mut self, condition: Expr) {
        self.conditions.extend(condition.flatten());
    }

    /// The most recently declared unit with this name.
    pub fn unit_index(&self, name: &str) -> Option<usize> {
        self.units.iter().rev().find(|u| u.name == name).map(|u| u.index)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flatten_splits_top_level_conjunctions() {
        let expr = Expr::feature(0, "a:b")
            .eq(Expr::literal(1))
            .and_(Expr::feature(0, "c:d").eq(Expr::literal(2)).and_(
                Expr::feature(1, "e:f").eq(Expr::literal(3)).or_(Expr::literal(true)),
            ));
        let clauses = expr.flatten();
        assert_eq!(clauses.len(), 3);
        // The OR stays intact as a single clause.
        assert!(matches!(
            clauses[2],
            Expr::Binary { op: BinOp::Or, .. }
        ));
    }

    #[test]
    fn units_implicitly_require_activity() {
        let mut query = Query::new();
        let w = query.add_unit("W", vec!["word".to_string()], None);
        assert_eq!(w, 0);
        assert_eq!(
            query.conditions[0],
            Expr::feature(0, "meta:active").eq(Expr::literal(true))
        );
    }

    #[test]
    fn name_lookup_prefers_the_latest_declaration() {
        let mut query = Query::new();
        query.add_unit("N", vec!["word".to_string()], None);
        query.add_unit("N", vec!["phrase".to_string()], None);
        assert_eq!(query.unit_index("N"), Some(1));
        assert_eq!(query.unit_index("M"), None);
    }
}
