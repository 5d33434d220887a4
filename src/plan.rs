//! The plan representation: what the planner hands the executor.
//!
//! A plan is deliberately separate from the statement model -- it talks
//! about access paths (which index, point vs range vs ordered scan),
//! not about SQL.  One statement produces one plan; an OR'd WHERE clause
//! produces several scans inside it, executed in order with no
//! deduplication.

use crate::ast::{CmpOp, JoinKind, OneOrMore, OrderBy};
use crate::key::{Key, RangeCondition};

/// How one scan walks the base table.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanKind {
    /// Walk the clustered tree in row-ID order.
    Sequential,
    /// Exact index keys, each resolved to row IDs and fetched.
    IndexPoint { index: String, keys: Vec<Key> },
    /// Ordered walk of an index between bounds.
    IndexRange {
        index: String,
        range: RangeCondition,
        reverse: bool,
    },
    /// Full ordered walk of an index, forward or reverse.
    IndexAll { index: String, reverse: bool },
}

/// One scan plus the residual predicate to apply post-fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub kind: ScanKind,
    pub filters: OneOrMore,
}

impl Scan {
    pub fn sequential(filters: OneOrMore) -> Scan {
        Scan {
            kind: ScanKind::Sequential,
            filters,
        }
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self.kind, ScanKind::Sequential)
    }
}

/// Access path for a join's inner table, chosen per join column.
#[derive(Debug, Clone, PartialEq)]
pub enum InnerScan {
    /// Index-point lookup per outer row.
    IndexPoint { index: String },
    /// No usable index: sequential inner scan per outer row.
    Sequential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinPlan {
    pub table: String,
    pub alias: String,
    pub kind: JoinKind,
    /// Equi-join pairs: (outer column of the base table, inner column).
    pub on: Vec<(String, String)>,
    pub scan: InnerScan,
    /// Atoms pushed down to this table by alias prefix, bare names.
    pub filters: OneOrMore,
}

/// Projection after name resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputColumns {
    All,
    /// Resolved output names (qualified when joins are present).
    Named(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub table: String,
    pub alias: String,
    pub scans: Vec<Scan>,
    pub joins: Vec<JoinPlan>,
    /// WHERE retained for evaluation on combined rows when push-down
    /// would be incorrect (OR across aliases).
    pub post_filters: OneOrMore,
    pub output: OutputColumns,
    pub count_only: bool,
    pub order_by: Vec<OrderBy>,
    pub sort_in_memory: bool,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Plan {
    /// A range atom's operator folded into bound form: `(is_lower,
    /// inclusive)`.
    pub fn range_bound_shape(op: CmpOp) -> Option<(bool, bool)> {
        match op {
            CmpOp::Gt => Some((true, false)),
            CmpOp::Ge => Some((true, true)),
            CmpOp::Lt => Some((false, false)),
            CmpOp::Le => Some((false, true)),
            _ => None,
        }
    }
}
