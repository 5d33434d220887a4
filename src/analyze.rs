//! ANALYZE: per-table row counts and per-index distinct-prefix counts,
//! written into `minisql_stat` and read back opportunistically by the
//! planner's range-selectivity gate.
//!
//! A table's stat row holds its row count; each index's row holds the
//! index entry count followed by one distinct-prefix count per indexed
//! column, space-joined (`"100 2 10 100"` for a three-column key).

use itertools::Itertools;
use log::debug;
use std::collections::HashMap;

use crate::catalog::{Catalog, IndexDef, STAT_TABLE_NAME};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::Key;
use crate::pager::Pager;
use crate::row::Row;
use crate::sql_value::SqlValue;
use crate::table::Table;
use crate::transaction::Transaction;

/// What the planner consumes.
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    /// Number of rows at ANALYZE time; 0 or missing disables estimates.
    pub n_entry: i64,
    /// Per index: distinct k-prefix counts, k = 1..=len(columns).
    pub n_distinct: HashMap<String, Vec<i64>>,
}

fn stat_table<'p>(pager: &'p Pager, catalog: &Catalog) -> Result<Option<Table<'p>>> {
    match catalog.tables.get(STAT_TABLE_NAME) {
        None => Ok(None),
        Some(schema) => Ok(Some(Table::new(pager, schema.clone(), vec![]))),
    }
}

/// Recompute and rewrite a table's statistics, all in the caller's
/// transaction.
pub fn execute_analyze(pager: &Pager, tx: &mut Transaction, table_name: &str) -> Result<()> {
    let catalog = Catalog::load(pager, tx)?;
    let schema = catalog.table(table_name)?.clone();
    let stats = stat_table(pager, &catalog)?
        .ok_or_else(|| Error::internal("minisql_stat missing; database not bootstrapped"))?;

    // NEntry: one pass over the clustered tree.
    let table = Table::new(pager, schema, vec![]);
    let tree = table.tree();
    let mut n_entry: i64 = 0;
    let mut cursor = tree.scan_forward(tx, None, None)?;
    while let Some(_) = cursor.next(&tree, tx)? {
        n_entry += 1;
    }

    let mut rows = vec![stat_row(table_name, None, &[n_entry])];
    for def in catalog.indexes_of(table_name) {
        let counts = index_counts(pager, tx, def)?;
        rows.push(stat_row(table_name, Some(&def.name), &counts));
    }

    clear_stats(pager, tx, &catalog, table_name)?;
    for row in rows {
        stats.insert_row(tx, row)?;
    }
    debug!("analyzed {}: {} rows", table_name, n_entry);
    Ok(())
}

/// `[entry count, distinct 1-prefixes, …, distinct full keys]`.
fn index_counts(pager: &Pager, tx: &mut Transaction, def: &IndexDef) -> Result<Vec<i64>> {
    let index = Index::new(pager, def.clone());
    let tree = index.tree();
    let mut keys: Vec<Key> = vec![];
    let mut entries: i64 = 0;
    let mut cursor = tree.scan_forward(tx, None, None)?;
    while let Some((key, payload)) = cursor.next(&tree, tx)? {
        entries += index.row_ids_of(tx, &payload)?.len() as i64;
        keys.push(key);
    }

    let ncols = def.columns.len();
    let mut counts = vec![entries];
    for k in 1..=ncols {
        // The scan is ordered, so equal prefixes are adjacent.
        let distinct = keys
            .iter()
            .map(|key| prefix_of(key, k))
            .dedup()
            .count() as i64;
        counts.push(distinct);
    }
    Ok(counts)
}

fn prefix_of(key: &Key, k: usize) -> Key {
    match key {
        Key::Composite(ck) => Key::Composite(ck.prefix(k)),
        other => other.clone(),
    }
}

fn stat_row(table: &str, index: Option<&str>, counts: &[i64]) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(table.to_string()),
        match index {
            Some(name) => SqlValue::Text(name.to_string()),
            None => SqlValue::Null,
        },
        SqlValue::Text(counts.iter().join(" ")),
    ]
}

/// Drop a table's stat rows (before a rewrite, or with the table itself).
pub fn clear_stats(
    pager: &Pager,
    tx: &mut Transaction,
    catalog: &Catalog,
    table_name: &str,
) -> Result<()> {
    let stats = match stat_table(pager, catalog)? {
        Some(t) => t,
        None => return Ok(()),
    };
    let tree = stats.tree();
    let mut doomed = vec![];
    let mut cursor = tree.scan_forward(tx, None, None)?;
    while let Some((row_id, data)) = cursor.next(&tree, tx)? {
        let row = stats.row_from_data(tx, row_id, &data, Some(&[0]))?;
        if matches!(&row.items[0], SqlValue::Text(t) if t == table_name) {
            doomed.push(row_id);
        }
    }
    for id in doomed {
        stats.delete_row(tx, id)?;
    }
    Ok(())
}

/// The planner's opportunistic read: `None` when the table was never
/// analyzed (or the stat table does not exist yet).
pub fn load_stats(
    pager: &Pager,
    tx: &mut Transaction,
    catalog: &Catalog,
    table_name: &str,
) -> Result<Option<TableStats>> {
    let stats = match stat_table(pager, catalog)? {
        Some(t) => t,
        None => return Ok(None),
    };
    let tree = stats.tree();
    let mut rows: Vec<Row> = vec![];
    let mut cursor = tree.scan_forward(tx, None, None)?;
    while let Some((row_id, data)) = cursor.next(&tree, tx)? {
        let row = stats.row_from_data(tx, row_id, &data, None)?;
        if matches!(&row.items[0], SqlValue::Text(t) if t == table_name) {
            rows.push(row);
        }
    }
    if rows.is_empty() {
        return Ok(None);
    }
    let mut out = TableStats::default();
    for row in rows {
        let val = match &row.items[2] {
            SqlValue::Text(s) => s.clone(),
            other => {
                return Err(Error::corrupt(format!("stat value {:?}", other)))
            }
        };
        let counts: Vec<i64> = val
            .split_whitespace()
            .map(|w| {
                w.parse::<i64>()
                    .map_err(|_| Error::corrupt(format!("stat value {:?}", val)))
            })
            .collect::<Result<_>>()?;
        match &row.items[1] {
            SqlValue::Null => {
                out.n_entry = *counts.first().unwrap_or(&0);
            }
            SqlValue::Text(index_name) => {
                out.n_distinct
                    .insert(index_name.clone(), counts[1..].to_vec());
            }
            other => return Err(Error::corrupt(format!("stat index {:?}", other))),
        }
    }
    Ok(Some(out))
}
