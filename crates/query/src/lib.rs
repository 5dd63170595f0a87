//! Pattern search over the annotation graph: a typed query AST, a textual
//! mini-language, a planner that compiles patterns to a single relational
//! selection, and a result table that projects features onto matches for
//! writers to drain.

pub mod ast;
mod compile;
mod error;
mod exec;
mod result;
mod spec;
mod text;

pub use ast::{BinOp, Expr, Query, Subquery, Unit};
pub use error::{Error, Result};
pub use exec::{search, Binding, Match, Matches};
pub use result::ResultTable;
pub use spec::{build_query, FeatureCondition, QuerySpec, SubquerySpec, TypeSpec, UnitSpec};
pub use text::parse_query;
