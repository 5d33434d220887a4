//! Statement execution: drive the planned scans, join, filter, sort and
//! limit, and hand rows back through a pull iterator.
//!
//! Execution is single-threaded cooperative inside the caller's
//! transaction.  Scan cursors hold no borrows, so each produced row can
//! fetch from the table tree and resolve overflow chains before the next
//! cursor step; the cancel token is checked at every page read and every
//! emitted row.  Writers (UPDATE/DELETE) collect matching row IDs first
//! and only then mutate, so they never walk a tree they are editing.

use log::debug;
use std::collections::HashSet;

use crate::analyze;
use crate::ast::{
    CmpOp, Condition, InsertStmt, JoinKind, OneOrMore, Operand, SelectStmt, Statement, UpdateStmt,
};
use crate::btree::tree::{BTree, IndexTree, TableTree};
use crate::btree::RowId;
use crate::catalog::{self, Catalog, IndexKind};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::Key;
use crate::pager::Pager;
use crate::plan::{InnerScan, OutputColumns, Plan, Scan, ScanKind};
use crate::planner;
use crate::row::Row;
use crate::sql_value::SqlValue;
use crate::table::Table;
use crate::transaction::Transaction;

/// `{columns, rows iterator, rows_affected}`; the iterator surface is
/// pull-based.
#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows_affected: u64,
    rows: std::vec::IntoIter<Row>,
}

impl QueryResult {
    fn with_rows(columns: Vec<String>, rows: Vec<Row>) -> QueryResult {
        QueryResult {
            columns,
            rows_affected: 0,
            rows: rows.into_iter(),
        }
    }

    fn affected(n: u64) -> QueryResult {
        QueryResult {
            columns: vec![],
            rows_affected: n,
            rows: vec![].into_iter(),
        }
    }

    /// No columns, no rows: transaction-control statements.
    pub(crate) fn empty() -> QueryResult {
        QueryResult::affected(0)
    }

    /// Drain the iterator into a vector (convenience for embedders and
    /// tests; streaming callers just iterate).
    pub fn collect_rows(self) -> Vec<Row> {
        self.rows.collect()
    }
}

impl Iterator for QueryResult {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(Ok)
    }
}

/// Run one statement inside `tx`.  BEGIN/COMMIT/ROLLBACK are the database
/// handle's business, not a statement execution.
pub fn execute_statement(
    pager: &Pager,
    tx: &mut Transaction,
    stmt: &Statement,
) -> Result<QueryResult> {
    match stmt {
        Statement::Select(s) => execute_select(pager, tx, s),
        Statement::Insert(s) => execute_insert(pager, tx, s),
        Statement::Update(s) => execute_update(pager, tx, s),
        Statement::Delete(s) => execute_delete(pager, tx, s),
        Statement::CreateTable(s) => execute_create_table(pager, tx, s),
        Statement::CreateIndex(s) => execute_create_index(pager, tx, s),
        Statement::DropTable(s) => execute_drop_table(pager, tx, &s.table),
        Statement::DropIndex(s) => execute_drop_index(pager, tx, &s.name),
        Statement::Analyze(s) => {
            analyze::execute_analyze(pager, tx, &s.table)?;
            Ok(QueryResult::affected(0))
        }
        Statement::Begin | Statement::Commit | Statement::Rollback => Err(Error::internal(
            "transaction control reached the executor",
        )),
    }
}

fn table_for<'p>(pager: &'p Pager, catalog: &Catalog, name: &str) -> Result<Table<'p>> {
    let schema = catalog.table(name)?.clone();
    let indexes = catalog
        .indexes_of(name)
        .into_iter()
        .cloned()
        .collect();
    Ok(Table::new(pager, schema, indexes))
}

fn index_for<'p>(pager: &'p Pager, catalog: &Catalog, name: &str) -> Result<Index<'p>> {
    let def = catalog
        .index(name)
        .ok_or_else(|| Error::NotFound(format!("index {}", name)))?
        .clone();
    Ok(Index::new(pager, def))
}

// ---- SELECT ---------------------------------------------------------------

fn execute_select(pager: &Pager, tx: &mut Transaction, stmt: &SelectStmt) -> Result<QueryResult> {
    let catalog = Catalog::load(pager, tx)?;
    let stats = analyze::load_stats(pager, tx, &catalog, &stmt.table)?;
    let plan = planner::plan_select(&catalog, stmt, stats.as_ref())?;
    run_plan(pager, tx, &catalog, &plan)
}

/// Column names of the combined row: bare for a single table, alias
/// qualified once joins are in play.
fn combined_columns(catalog: &Catalog, plan: &Plan) -> Result<Vec<String>> {
    let base = catalog.table(&plan.table)?;
    let mut names = vec![];
    if plan.joins.is_empty() {
        names.extend(base.column_names());
        return Ok(names);
    }
    for c in &base.columns {
        names.push(format!("{}.{}", plan.alias, c.name));
    }
    for join in &plan.joins {
        let schema = catalog.table(&join.table)?;
        for c in &schema.columns {
            names.push(format!("{}.{}", join.alias, c.name));
        }
    }
    Ok(names)
}

/// Base-table columns a scan actually needs; `None` fetches everything.
fn wanted_columns(plan: &Plan, scan: &Scan, catalog: &Catalog) -> Result<Option<Vec<usize>>> {
    if !plan.joins.is_empty() {
        return Ok(None);
    }
    let named = match &plan.output {
        OutputColumns::All => return Ok(None),
        OutputColumns::Named(names) => names,
    };
    let schema = catalog.table(&plan.table)?;
    let mut wanted = HashSet::new();
    for name in named {
        wanted.insert(schema.column_index(name)?);
    }
    for group in &scan.filters.0 {
        for cond in group {
            if let Some(f) = cond.field() {
                wanted.insert(schema.column_index(f)?);
            }
        }
    }
    for ob in &plan.order_by {
        wanted.insert(schema.column_index(&ob.field)?);
    }
    let mut wanted: Vec<usize> = wanted.into_iter().collect();
    wanted.sort_unstable();
    Ok(Some(wanted))
}

fn run_plan(
    pager: &Pager,
    tx: &mut Transaction,
    catalog: &Catalog,
    plan: &Plan,
) -> Result<QueryResult> {
    let columns = combined_columns(catalog, plan)?;
    let base = table_for(pager, catalog, &plan.table)?;

    let mut sink = Sink::for_plan(plan, &columns)?;
    let mut right_matched: HashSet<RowId> = HashSet::new();

    'scans: for scan in &plan.scans {
        let wanted = wanted_columns(plan, scan, catalog)?;
        let mut on_row = |tx: &mut Transaction, row: Row| -> Result<bool> {
            tx.check_cancelled()?;
            drive_joins(
                pager, catalog, plan, tx, 0, &columns, row, &mut sink, &mut right_matched,
            )
        };
        let keep_going = drive_scan(
            pager,
            tx,
            catalog,
            &base,
            scan,
            wanted.as_deref(),
            &mut on_row,
        )?;
        if !keep_going {
            break 'scans;
        }
    }

    // A RIGHT join preserves unmatched inner rows with an all-NULL base.
    if let Some(join) = plan.joins.first() {
        if join.kind == JoinKind::Right {
            emit_unmatched_right(pager, tx, catalog, plan, &columns, &right_matched, &mut sink)?;
        }
    }

    sink.finish(plan, &columns, catalog)
}

/// Drive one scan, feeding rows that pass its filters into `on_row`.
/// Returns false when the consumer has had enough.
fn drive_scan(
    pager: &Pager,
    tx: &mut Transaction,
    catalog: &Catalog,
    table: &Table,
    scan: &Scan,
    wanted: Option<&[usize]>,
    on_row: &mut dyn FnMut(&mut Transaction, Row) -> Result<bool>,
) -> Result<bool> {
    match &scan.kind {
        ScanKind::Sequential => {
            let tree = table.tree();
            let mut cursor = tree.scan_forward(tx, None, None)?;
            while let Some((row_id, data)) = cursor.next(&tree, tx)? {
                let row = table.row_from_data(tx, row_id, &data, wanted)?;
                if !eval_dnf(&scan.filters, &table.schema.column_names(), &row.items)? {
                    continue;
                }
                if !on_row(tx, row)? {
                    return Ok(false);
                }
            }
        }
        ScanKind::IndexPoint { index, keys } => {
            let index = index_for(pager, catalog, index)?;
            for key in keys {
                let ids = match index.find_row_ids(tx, key) {
                    Ok(ids) => ids,
                    // A key nobody has: recovered locally, skip it.
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                for id in ids {
                    let row = match table.fetch_row(tx, id, wanted)? {
                        Some(row) => row,
                        None => continue,
                    };
                    if !eval_dnf(&scan.filters, &table.schema.column_names(), &row.items)? {
                        continue;
                    }
                    if !on_row(tx, row)? {
                        return Ok(false);
                    }
                }
            }
        }
        ScanKind::IndexRange {
            index,
            range,
            reverse,
        } => {
            let index = index_for(pager, catalog, index)?;
            let tree: BTree<IndexTree> = index.tree();
            let lower = range.lower.clone().map(|b| (b.key, b.inclusive));
            let upper = range.upper.clone().map(|b| (b.key, b.inclusive));
            if *reverse {
                let mut cursor = tree.scan_reverse(tx, lower, upper)?;
                while let Some((_, payload)) = cursor.next(&tree, tx)? {
                    if !emit_index_rows(
                        tx, table, &index, &payload, scan, wanted, on_row,
                    )? {
                        return Ok(false);
                    }
                }
            } else {
                let mut cursor = tree.scan_forward(tx, lower, upper)?;
                while let Some((_, payload)) = cursor.next(&tree, tx)? {
                    if !emit_index_rows(
                        tx, table, &index, &payload, scan, wanted, on_row,
                    )? {
                        return Ok(false);
                    }
                }
            }
        }
        ScanKind::IndexAll { index, reverse } => {
            let index = index_for(pager, catalog, index)?;
            let tree: BTree<IndexTree> = index.tree();
            if *reverse {
                let mut cursor = tree.scan_reverse(tx, None, None)?;
                while let Some((_, payload)) = cursor.next(&tree, tx)? {
                    if !emit_index_rows(
                        tx, table, &index, &payload, scan, wanted, on_row,
                    )? {
                        return Ok(false);
                    }
                }
            } else {
                let mut cursor = tree.scan_forward(tx, None, None)?;
                while let Some((_, payload)) = cursor.next(&tree, tx)? {
                    if !emit_index_rows(
                        tx, table, &index, &payload, scan, wanted, on_row,
                    )? {
                        return Ok(false);
                    }
                }
            }
        }
    }
    Ok(true)
}

fn emit_index_rows(
    tx: &mut Transaction,
    table: &Table,
    index: &Index,
    payload: &crate::btree::node::RowIdPayload,
    scan: &Scan,
    wanted: Option<&[usize]>,
    on_row: &mut dyn FnMut(&mut Transaction, Row) -> Result<bool>,
) -> Result<bool> {
    for id in index.row_ids_of(tx, payload)? {
        let row = match table.fetch_row(tx, id, wanted)? {
            Some(row) => row,
            None => continue,
        };
        if !eval_dnf(&scan.filters, &table.schema.column_names(), &row.items)? {
            continue;
        }
        if !on_row(tx, row)? {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---- joins ----------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn drive_joins(
    pager: &Pager,
    catalog: &Catalog,
    plan: &Plan,
    tx: &mut Transaction,
    depth: usize,
    columns: &[String],
    row: Row,
    sink: &mut Sink,
    right_matched: &mut HashSet<RowId>,
) -> Result<bool> {
    if depth == plan.joins.len() {
        if !eval_dnf(&plan.post_filters, columns, &row.items)? {
            return Ok(true);
        }
        return sink.emit(tx, row);
    }
    let join = &plan.joins[depth];
    let inner_table = table_for(pager, catalog, &join.table)?;
    let inner_names = inner_table.schema.column_names();

    // Candidate inner rows for this outer row.
    let mut candidates: Vec<Row> = vec![];
    match &join.scan {
        InnerScan::IndexPoint { index } => {
            let index = index_for(pager, catalog, index)?;
            let outer_name = format!("{}.{}", plan.alias, join.on[0].0);
            let outer_value = value_by_name(columns, &row.items, &outer_name)?;
            if !outer_value.is_null() {
                let inner_pos = inner_table.schema.column_index(&join.on[0].1)?;
                let inner_ty = inner_table.schema.columns[inner_pos].sql_type;
                let key = Key::from_value(&outer_value.clone().cast_to(inner_ty)?);
                match index.find_row_ids(tx, &key) {
                    Ok(ids) => {
                        for id in ids {
                            if let Some(r) = inner_table.fetch_row(tx, id, None)? {
                                candidates.push(r);
                            }
                        }
                    }
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        InnerScan::Sequential => {
            let tree = inner_table.tree();
            let mut cursor = tree.scan_forward(tx, None, None)?;
            while let Some((row_id, data)) = cursor.next(&tree, tx)? {
                candidates.push(inner_table.row_from_data(tx, row_id, &data, None)?);
            }
        }
    }

    let mut matched = false;
    for inner in candidates {
        if !eval_dnf(&join.filters, &inner_names, &inner.items)? {
            continue;
        }
        // Every ON pair must hold, not just the one the index served.
        let mut all_on = true;
        for (outer_col, inner_col) in &join.on {
            let outer_v =
                value_by_name(columns, &row.items, &format!("{}.{}", plan.alias, outer_col))?;
            let inner_pos = inner_table.schema.column_index(inner_col)?;
            if !outer_v.sql_eq(&inner.items[inner_pos]) {
                all_on = false;
                break;
            }
        }
        if !all_on {
            continue;
        }
        matched = true;
        if join.kind == JoinKind::Right {
            right_matched.insert(inner.row_id);
        }
        let mut combined = row.clone();
        combined.items.extend(inner.items.clone());
        if !drive_joins(
            pager,
            catalog,
            plan,
            tx,
            depth + 1,
            columns,
            combined,
            sink,
            right_matched,
        )? {
            return Ok(false);
        }
    }

    if !matched && join.kind == JoinKind::Left {
        let mut combined = row;
        combined
            .items
            .extend(std::iter::repeat(SqlValue::Null).take(inner_names.len()));
        return drive_joins(
            pager,
            catalog,
            plan,
            tx,
            depth + 1,
            columns,
            combined,
            sink,
            right_matched,
        );
    }
    Ok(true)
}

/// The RIGHT-join tail: inner rows no base row matched, padded with NULLs
/// on the base side.
fn emit_unmatched_right(
    pager: &Pager,
    tx: &mut Transaction,
    catalog: &Catalog,
    plan: &Plan,
    columns: &[String],
    right_matched: &HashSet<RowId>,
    sink: &mut Sink,
) -> Result<()> {
    let join = &plan.joins[0];
    let base_width = catalog.table(&plan.table)?.columns.len();
    let inner_table = table_for(pager, catalog, &join.table)?;
    let inner_names = inner_table.schema.column_names();

    let tree = inner_table.tree();
    let mut unmatched = vec![];
    let mut cursor = tree.scan_forward(tx, None, None)?;
    while let Some((row_id, data)) = cursor.next(&tree, tx)? {
        if right_matched.contains(&row_id) {
            continue;
        }
        unmatched.push(inner_table.row_from_data(tx, row_id, &data, None)?);
    }
    for inner in unmatched {
        if !eval_dnf(&join.filters, &inner_names, &inner.items)? {
            continue;
        }
        let mut items = vec![SqlValue::Null; base_width];
        items.extend(inner.items);
        let row = Row { row_id: 0, items };
        if !eval_dnf(&plan.post_filters, columns, &row.items)? {
            continue;
        }
        if !sink.emit(tx, row)? {
            break;
        }
    }
    Ok(())
}

// ---- filters --------------------------------------------------------------

fn value_by_name<'a>(names: &[String], values: &'a [SqlValue], name: &str) -> Result<&'a SqlValue> {
    names
        .iter()
        .position(|n| n == name)
        .map(|i| &values[i])
        .ok_or_else(|| Error::internal(format!("column {} missing from row", name)))
}

/// DNF evaluation: OR over groups, AND within.
pub fn eval_dnf(conditions: &OneOrMore, names: &[String], values: &[SqlValue]) -> Result<bool> {
    if conditions.is_empty() {
        return Ok(true);
    }
    'groups: for group in &conditions.0 {
        for cond in group {
            if !eval_condition(cond, names, values)? {
                continue 'groups;
            }
        }
        return Ok(true);
    }
    Ok(false)
}

fn eval_condition(cond: &Condition, names: &[String], values: &[SqlValue]) -> Result<bool> {
    let field = cond
        .field()
        .ok_or_else(|| Error::internal("unnormalized condition in executor"))?;
    let v = value_by_name(names, values, field)?;
    Ok(match (&cond.op, &cond.operand2) {
        (CmpOp::IsNull, _) => v.is_null(),
        (CmpOp::IsNotNull, _) => !v.is_null(),
        (CmpOp::Eq, Operand::Literal(lit)) => v.sql_eq(lit),
        (CmpOp::Ne, Operand::Literal(lit)) => {
            !v.is_null() && !lit.is_null() && !v.sql_eq(lit)
        }
        (CmpOp::Lt, Operand::Literal(lit)) => cmp_non_null(v, lit, |o| o.is_lt())?,
        (CmpOp::Le, Operand::Literal(lit)) => cmp_non_null(v, lit, |o| o.is_le())?,
        (CmpOp::Gt, Operand::Literal(lit)) => cmp_non_null(v, lit, |o| o.is_gt())?,
        (CmpOp::Ge, Operand::Literal(lit)) => cmp_non_null(v, lit, |o| o.is_ge())?,
        (CmpOp::In, Operand::List(list)) => list.iter().any(|lit| v.sql_eq(lit)),
        (CmpOp::NotIn, Operand::List(list)) => {
            !v.is_null() && !list.iter().any(|lit| v.sql_eq(lit))
        }
        (op, operand) => {
            return Err(Error::internal(format!(
                "operator {:?} with operand {:?}",
                op, operand
            )))
        }
    })
}

fn cmp_non_null(
    v: &SqlValue,
    lit: &SqlValue,
    pred: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<bool> {
    if v.is_null() || lit.is_null() {
        return Ok(false);
    }
    Ok(pred(v.sort_cmp(lit)))
}

// ---- sinks: collect / top-N / streaming limit / count ---------------------

struct HeapRow {
    ord: Vec<(SqlValue, bool)>,
    seq: u64,
    row: Row,
}

impl HeapRow {
    fn rank(&self, other: &Self) -> std::cmp::Ordering {
        for ((av, desc), (bv, _)) in self.ord.iter().zip(other.ord.iter()) {
            let mut o = av.sort_cmp(bv);
            if *desc {
                o = o.reverse();
            }
            if o != std::cmp::Ordering::Equal {
                return o;
            }
        }
        self.seq.cmp(&other.seq)
    }
}

impl PartialEq for HeapRow {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for HeapRow {}
impl PartialOrd for HeapRow {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapRow {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank(other)
    }
}

enum Sink {
    /// Streaming OFFSET/LIMIT; no ordering requirement.
    Stream {
        rows: Vec<Row>,
        to_skip: u64,
        remaining: Option<u64>,
    },
    /// Full in-memory sort, offset/limit applied afterwards.
    Collect { rows: Vec<Row>, keys: Vec<(usize, bool)> },
    /// `ORDER BY … LIMIT n`: a bounded heap of the best `n + offset`.
    TopN {
        heap: std::collections::BinaryHeap<HeapRow>,
        cap: usize,
        keys: Vec<(usize, bool)>,
        seq: u64,
    },
    Count(u64),
}

impl Sink {
    fn for_plan(plan: &Plan, columns: &[String]) -> Result<Sink> {
        if plan.count_only {
            return Ok(Sink::Count(0));
        }
        if !plan.sort_in_memory {
            return Ok(Sink::Stream {
                rows: vec![],
                to_skip: plan.offset,
                remaining: plan.limit,
            });
        }
        let keys: Result<Vec<(usize, bool)>> = plan
            .order_by
            .iter()
            .map(|ob| {
                columns
                    .iter()
                    .position(|c| *c == ob.field)
                    .map(|i| (i, ob.desc))
                    .ok_or_else(|| Error::internal(format!("order column {} missing", ob.field)))
            })
            .collect();
        let keys = keys?;
        match plan.limit {
            Some(limit) => Ok(Sink::TopN {
                heap: std::collections::BinaryHeap::new(),
                cap: (limit + plan.offset) as usize,
                keys,
                seq: 0,
            }),
            None => Ok(Sink::Collect { rows: vec![], keys }),
        }
    }

    /// Feed one combined row; false means the pipeline can stop early.
    fn emit(&mut self, tx: &mut Transaction, row: Row) -> Result<bool> {
        tx.check_cancelled()?;
        match self {
            Sink::Stream {
                rows,
                to_skip,
                remaining,
            } => {
                if *to_skip > 0 {
                    *to_skip -= 1;
                    return Ok(true);
                }
                match remaining {
                    None => {
                        rows.push(row);
                        Ok(true)
                    }
                    Some(0) => Ok(false),
                    Some(n) => {
                        rows.push(row);
                        *n -= 1;
                        Ok(*n > 0)
                    }
                }
            }
            Sink::Collect { rows, .. } => {
                rows.push(row);
                Ok(true)
            }
            Sink::TopN {
                heap,
                cap,
                keys,
                seq,
            } => {
                if *cap == 0 {
                    return Ok(false);
                }
                let ord = keys
                    .iter()
                    .map(|(i, desc)| (row.items[*i].clone(), *desc))
                    .collect();
                let entry = HeapRow {
                    ord,
                    seq: *seq,
                    row,
                };
                *seq += 1;
                if heap.len() < *cap {
                    heap.push(entry);
                } else if let Some(worst) = heap.peek() {
                    // Replace the root only when this row ranks better.
                    if entry.rank(worst) == std::cmp::Ordering::Less {
                        heap.pop();
                        heap.push(entry);
                    }
                }
                Ok(true)
            }
            Sink::Count(n) => {
                *n += 1;
                Ok(true)
            }
        }
    }

    fn finish(self, plan: &Plan, columns: &[String], catalog: &Catalog) -> Result<QueryResult> {
        let rows = match self {
            Sink::Count(n) => {
                return Ok(QueryResult {
                    columns: vec![String::from("count")],
                    rows_affected: 0,
                    rows: vec![Row {
                        row_id: 0,
                        items: vec![SqlValue::Int8(n as i64)],
                    }]
                    .into_iter(),
                })
            }
            Sink::Stream { rows, .. } => rows,
            Sink::Collect { mut rows, keys } => {
                rows.sort_by(|a, b| {
                    for (i, desc) in &keys {
                        let mut o = a.items[*i].sort_cmp(&b.items[*i]);
                        if *desc {
                            o = o.reverse();
                        }
                        if o != std::cmp::Ordering::Equal {
                            return o;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                let skip = plan.offset as usize;
                let rows: Vec<Row> = rows.into_iter().skip(skip).collect();
                match plan.limit {
                    Some(limit) => rows.into_iter().take(limit as usize).collect(),
                    None => rows,
                }
            }
            Sink::TopN { heap, .. } => {
                let sorted = heap.into_sorted_vec();
                sorted
                    .into_iter()
                    .map(|e| e.row)
                    .skip(plan.offset as usize)
                    .collect()
            }
        };
        project(plan, columns, rows, catalog)
    }
}

/// Apply the projection last, after sort and limit, so ORDER BY can use
/// columns the client did not ask for.
fn project(
    plan: &Plan,
    columns: &[String],
    rows: Vec<Row>,
    _catalog: &Catalog,
) -> Result<QueryResult> {
    match &plan.output {
        OutputColumns::All => Ok(QueryResult::with_rows(columns.to_vec(), rows)),
        OutputColumns::Named(names) => {
            let positions: Result<Vec<usize>> = names
                .iter()
                .map(|n| {
                    columns
                        .iter()
                        .position(|c| c == n)
                        .ok_or_else(|| Error::validation(format!("unknown column {}", n)))
                })
                .collect();
            let positions = positions?;
            let projected = rows
                .into_iter()
                .map(|r| Row {
                    row_id: r.row_id,
                    items: positions.iter().map(|i| r.items[*i].clone()).collect(),
                })
                .collect();
            Ok(QueryResult::with_rows(names.clone(), projected))
        }
    }
}

// ---- INSERT / UPDATE / DELETE ---------------------------------------------

fn execute_insert(pager: &Pager, tx: &mut Transaction, stmt: &InsertStmt) -> Result<QueryResult> {
    let catalog = Catalog::load(pager, tx)?;
    if is_reserved(&stmt.table) {
        return Err(Error::validation(format!(
            "{} is not writable by clients",
            stmt.table
        )));
    }
    let table = table_for(pager, &catalog, &stmt.table)?;

    // Map statement column order onto the declared order, NULL-filling
    // unnamed columns.
    let positions: Vec<usize> = if stmt.columns.is_empty() {
        (0..table.schema.columns.len()).collect()
    } else {
        stmt.columns
            .iter()
            .map(|c| table.schema.column_index(c))
            .collect::<Result<_>>()?
    };
    let mut rows = Vec::with_capacity(stmt.values.len());
    for tuple in &stmt.values {
        if tuple.len() != positions.len() {
            return Err(Error::validation(format!(
                "INSERT row has {} values for {} columns",
                tuple.len(),
                positions.len()
            )));
        }
        let mut full = vec![SqlValue::Null; table.schema.columns.len()];
        for (value, pos) in tuple.iter().zip(positions.iter()) {
            full[*pos] = value.clone();
        }
        rows.push(full);
    }
    let n = table.insert_rows(tx, rows)?;
    debug!("inserted {} rows into {}", n, stmt.table);
    Ok(QueryResult::affected(n))
}

/// Row IDs matched by a mutation plan, deduplicated across OR scans.
fn matching_row_ids(
    pager: &Pager,
    tx: &mut Transaction,
    catalog: &Catalog,
    table: &Table,
    plan: &Plan,
) -> Result<Vec<RowId>> {
    let mut seen = HashSet::new();
    let mut ids = vec![];
    for scan in &plan.scans {
        let mut on_row = |_tx: &mut Transaction, row: Row| -> Result<bool> {
            if seen.insert(row.row_id) {
                ids.push(row.row_id);
            }
            Ok(true)
        };
        drive_scan(pager, tx, catalog, table, scan, None, &mut on_row)?;
    }
    Ok(ids)
}

fn execute_update(pager: &Pager, tx: &mut Transaction, stmt: &UpdateStmt) -> Result<QueryResult> {
    let catalog = Catalog::load(pager, tx)?;
    if is_reserved(&stmt.table) {
        return Err(Error::validation(format!(
            "{} is not writable by clients",
            stmt.table
        )));
    }
    let stats = analyze::load_stats(pager, tx, &catalog, &stmt.table)?;
    let plan = planner::plan_mutation(&catalog, &stmt.table, &stmt.conditions, stats.as_ref())?;
    let table = table_for(pager, &catalog, &stmt.table)?;

    let changes: Vec<(usize, SqlValue)> = stmt
        .set
        .iter()
        .map(|(col, v)| Ok((table.schema.column_index(col)?, v.clone())))
        .collect::<Result<_>>()?;

    let ids = matching_row_ids(pager, tx, &catalog, &table, &plan)?;
    for id in &ids {
        tx.check_cancelled()?;
        table.update_row(tx, *id, &changes)?;
    }
    debug!("updated {} rows in {}", ids.len(), stmt.table);
    Ok(QueryResult::affected(ids.len() as u64))
}

fn execute_delete(
    pager: &Pager,
    tx: &mut Transaction,
    stmt: &crate::ast::DeleteStmt,
) -> Result<QueryResult> {
    let catalog = Catalog::load(pager, tx)?;
    if is_reserved(&stmt.table) {
        return Err(Error::validation(format!(
            "{} is not writable by clients",
            stmt.table
        )));
    }
    let stats = analyze::load_stats(pager, tx, &catalog, &stmt.table)?;
    let plan = planner::plan_mutation(&catalog, &stmt.table, &stmt.conditions, stats.as_ref())?;
    let table = table_for(pager, &catalog, &stmt.table)?;

    let ids = matching_row_ids(pager, tx, &catalog, &table, &plan)?;
    for id in &ids {
        tx.check_cancelled()?;
        table.delete_row(tx, *id)?;
    }
    debug!("deleted {} rows from {}", ids.len(), stmt.table);
    Ok(QueryResult::affected(ids.len() as u64))
}

// ---- DDL ------------------------------------------------------------------

fn is_reserved(name: &str) -> bool {
    name.starts_with("minisql_")
}

fn execute_create_table(
    pager: &Pager,
    tx: &mut Transaction,
    stmt: &crate::ast::CreateTableStmt,
) -> Result<QueryResult> {
    if is_reserved(&stmt.table) {
        return Err(Error::validation(format!(
            "table names starting with minisql_ are reserved ({})",
            stmt.table
        )));
    }
    create_table_raw(pager, tx, &stmt.table, &stmt.columns)?;
    Ok(QueryResult::affected(0))
}

/// Shared by user DDL and the `minisql_stat` bootstrap.
pub(crate) fn create_table_raw(
    pager: &Pager,
    tx: &mut Transaction,
    name: &str,
    columns: &[catalog::ColumnDef],
) -> Result<()> {
    let cat = Catalog::load(pager, tx)?;
    catalog::check_identifier(name)?;
    if cat.tables.contains_key(name) || cat.index(name).is_some() {
        return Err(Error::validation(format!("{} already exists", name)));
    }
    if columns.is_empty() || columns.len() > crate::MAX_COLUMNS {
        return Err(Error::validation(format!(
            "a table needs 1..={} columns",
            crate::MAX_COLUMNS
        )));
    }
    let mut names = HashSet::new();
    for col in columns {
        catalog::check_identifier(&col.name)?;
        if !names.insert(col.name.as_str()) {
            return Err(Error::validation(format!("duplicate column {}", col.name)));
        }
    }
    let pk_cols: Vec<&catalog::ColumnDef> =
        columns.iter().filter(|c| c.primary_key).collect();
    for col in &pk_cols {
        if col.autoincrement
            && !(pk_cols.len() == 1
                && matches!(col.sql_type, crate::sql_type::SqlType::Int4 | crate::sql_type::SqlType::Int8))
        {
            return Err(Error::validation(
                "autoincrement needs a single INT4/INT8 primary key column",
            ));
        }
    }

    let master = Table::master(pager, tx);
    let root = BTree::<TableTree>::create_empty(pager, tx)?;
    master.insert_row(tx, catalog::master_row_for_table(name, columns, root))?;

    if !pk_cols.is_empty() {
        let def = catalog::IndexDef {
            name: format!("{}_pk", name),
            table: name.to_string(),
            kind: IndexKind::Primary,
            columns: pk_cols.iter().map(|c| c.name.clone()).collect(),
            root: BTree::<IndexTree>::create_empty(pager, tx)?,
        };
        master.insert_row(tx, catalog::master_row_for_index(&def))?;
    }
    for col in columns.iter().filter(|c| c.unique && !c.primary_key) {
        let def = catalog::IndexDef {
            name: format!("{}_{}_key", name, col.name),
            table: name.to_string(),
            kind: IndexKind::Unique,
            columns: vec![col.name.clone()],
            root: BTree::<IndexTree>::create_empty(pager, tx)?,
        };
        master.insert_row(tx, catalog::master_row_for_index(&def))?;
    }
    debug!("created table {}", name);
    Ok(())
}

fn execute_create_index(
    pager: &Pager,
    tx: &mut Transaction,
    stmt: &crate::ast::CreateIndexStmt,
) -> Result<QueryResult> {
    let cat = Catalog::load(pager, tx)?;
    catalog::check_identifier(&stmt.name)?;
    if is_reserved(&stmt.table) {
        return Err(Error::validation(format!(
            "{} does not take user indexes",
            stmt.table
        )));
    }
    if cat.tables.contains_key(&stmt.name) || cat.index(&stmt.name).is_some() {
        return Err(Error::validation(format!("{} already exists", stmt.name)));
    }
    let schema = cat.table(&stmt.table)?.clone();
    if stmt.columns.is_empty() {
        return Err(Error::validation("an index needs at least one column"));
    }
    for col in &stmt.columns {
        schema.column_index(col)?;
    }

    let def = catalog::IndexDef {
        name: stmt.name.clone(),
        table: stmt.table.clone(),
        kind: if stmt.unique {
            IndexKind::Unique
        } else {
            IndexKind::Secondary
        },
        columns: stmt.columns.clone(),
        root: BTree::<IndexTree>::create_empty(pager, tx)?,
    };
    let master = Table::master(pager, tx);
    master.insert_row(tx, catalog::master_row_for_index(&def))?;

    // Backfill from existing rows; a unique violation aborts the DDL.
    let table = table_for(pager, &cat, &stmt.table)?;
    let index = Index::new(pager, def);
    let tree = table.tree();
    let mut entries = vec![];
    let mut cursor = tree.scan_forward(tx, None, None)?;
    while let Some((row_id, data)) = cursor.next(&tree, tx)? {
        let row = table.row_from_data(tx, row_id, &data, None)?;
        if let Some(key) = index.key_for_row(&table.schema, &row.items)? {
            entries.push((key, row_id));
        }
    }
    for (key, row_id) in entries {
        index.insert_entry(tx, &key, row_id)?;
    }
    debug!("created index {} on {}", stmt.name, stmt.table);
    Ok(QueryResult::affected(0))
}

/// Master rows are found by scanning; the catalog table is small and has
/// no indexes of its own.
fn master_row_ids(
    pager: &Pager,
    tx: &mut Transaction,
    pred: impl Fn(&Row) -> bool,
) -> Result<Vec<RowId>> {
    let master = Table::master(pager, tx);
    let tree = master.tree();
    let mut ids = vec![];
    let mut cursor = tree.scan_forward(tx, None, None)?;
    while let Some((row_id, data)) = cursor.next(&tree, tx)? {
        let row = master.row_from_data(tx, row_id, &data, None)?;
        if pred(&row) {
            ids.push(row_id);
        }
    }
    Ok(ids)
}

fn text_item(row: &Row, idx: usize) -> String {
    match &row.items[idx] {
        SqlValue::Text(s) => s.clone(),
        _ => String::new(),
    }
}

fn execute_drop_table(pager: &Pager, tx: &mut Transaction, name: &str) -> Result<QueryResult> {
    if is_reserved(name) {
        return Err(Error::validation(format!("{} cannot be dropped", name)));
    }
    let cat = Catalog::load(pager, tx)?;
    cat.table(name)?;

    // Indexes first (their overflow chains reference nothing else), then
    // the table's text chains and tree, then the catalog rows.
    for def in cat.indexes_of(name) {
        Index::new(pager, def.clone()).free_storage(tx)?;
    }
    let table = table_for(pager, &cat, name)?;
    table.free_storage(tx)?;

    let master = Table::master(pager, tx);
    let doomed = master_row_ids(pager, tx, |row| {
        text_item(row, 0) == name || text_item(row, 2) == name
    })?;
    for id in doomed {
        master.delete_row(tx, id)?;
    }
    // Stale statistics go with the table.
    analyze::clear_stats(pager, tx, &cat, name)?;
    debug!("dropped table {}", name);
    Ok(QueryResult::affected(0))
}

fn execute_drop_index(pager: &Pager, tx: &mut Transaction, name: &str) -> Result<QueryResult> {
    let cat = Catalog::load(pager, tx)?;
    let def = cat
        .index(name)
        .ok_or_else(|| Error::NotFound(format!("index {}", name)))?
        .clone();
    if def.kind == IndexKind::Primary {
        return Err(Error::validation(format!(
            "{} is a primary key index and cannot be dropped",
            name
        )));
    }
    Index::new(pager, def).free_storage(tx)?;
    let master = Table::master(pager, tx);
    let doomed = master_row_ids(pager, tx, |row| {
        text_item(row, 0) == name && text_item(row, 1) == "index"
    })?;
    for id in doomed {
        master.delete_row(tx, id)?;
    }
    debug!("dropped index {}", name);
    Ok(QueryResult::affected(0))
}
