//! The already-parsed statement model the engine consumes.
//!
//! SQL text parsing is an external collaborator; clients hand in these
//! values directly (or through the prepared-statement cache).  WHERE
//! clauses arrive in disjunctive normal form: a list of AND-groups with
//! OR between the groups.

use enum_as_inner::EnumAsInner;

use crate::catalog::ColumnDef;
use crate::sql_value::SqlValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable(CreateTableStmt),
    CreateIndex(CreateIndexStmt),
    DropTable(DropTableStmt),
    DropIndex(DropIndexStmt),
    Insert(InsertStmt),
    Select(SelectStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    Analyze(AnalyzeStmt),
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStmt {
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStmt {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropTableStmt {
    pub table: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropIndexStmt {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    /// Statement column order; empty means full declared order.
    pub columns: Vec<String>,
    pub values: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub table: String,
    pub alias: Option<String>,
    pub projection: Projection,
    pub conditions: OneOrMore,
    pub joins: Vec<Join>,
    pub order_by: Vec<OrderBy>,
    /// Kept as parsed values; validation insists on non-negative integers.
    pub limit: Option<SqlValue>,
    pub offset: Option<SqlValue>,
}

impl SelectStmt {
    pub fn on(table: &str) -> SelectStmt {
        SelectStmt {
            table: table.to_string(),
            alias: None,
            projection: Projection::Star,
            conditions: OneOrMore::default(),
            joins: vec![],
            order_by: vec![],
            limit: None,
            offset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Projection {
    Star,
    /// `COUNT(*)`.
    CountStar,
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub set: Vec<(String, SqlValue)>,
    pub conditions: OneOrMore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub conditions: OneOrMore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeStmt {
    pub table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub alias: Option<String>,
    pub kind: JoinKind,
    /// ON conditions, conjoined.  Planning extracts the equi-join pairs.
    pub on: Vec<Condition>,
}

impl Join {
    pub fn alias_or_table(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub desc: bool,
}

/// WHERE in DNF: OR over AND-groups.  An empty list matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OneOrMore(pub Vec<Vec<Condition>>);

impl OneOrMore {
    pub fn single_group(conditions: Vec<Condition>) -> OneOrMore {
        OneOrMore(vec![conditions])
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl CmpOp {
    pub fn is_equality(&self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::In)
    }

    pub fn is_range(&self) -> bool {
        matches!(self, CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge)
    }
}

/// Condition operands are typed: a column reference (optionally
/// alias-qualified), a literal, a literal list, or NULL.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Operand {
    Field(String),
    Literal(SqlValue),
    List(Vec<SqlValue>),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub operand1: Operand,
    pub op: CmpOp,
    pub operand2: Operand,
}

impl Condition {
    pub fn new(field: &str, op: CmpOp, operand2: Operand) -> Condition {
        Condition {
            operand1: Operand::Field(field.to_string()),
            op,
            operand2,
        }
    }

    pub fn eq(field: &str, value: SqlValue) -> Condition {
        Condition::new(field, CmpOp::Eq, Operand::Literal(value))
    }

    /// The column this condition constrains, when operand1 is a field.
    pub fn field(&self) -> Option<&str> {
        self.operand1.as_field().map(String::as_str)
    }
}

/// Split `alias.column` into its parts.
pub fn split_qualified(field: &str) -> (Option<&str>, &str) {
    match field.split_once('.') {
        Some((alias, col)) => (Some(alias), col),
        None => (None, field),
    }
}

#[test]
fn test_split_qualified() {
    assert_eq!(split_qualified("u.email"), (Some("u"), "email"));
    assert_eq!(split_qualified("email"), (None, "email"));
}

#[test]
fn test_one_or_more_empty() {
    assert!(OneOrMore::default().is_empty());
    assert!(OneOrMore(vec![vec![]]).is_empty());
    assert!(!OneOrMore::single_group(vec![Condition::eq(
        "a",
        SqlValue::Int4(1)
    )])
    .is_empty());
}
