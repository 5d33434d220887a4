//! Statement planning: choose an access path per AND-group, push WHERE
//! fragments down, and decide ordering strategy.
//!
//! Planning works per OR-group of the DNF.  Within a group the best
//! equality prefix over the available indexes wins (primary key beats
//! unique beats secondary, longer prefixes beat shorter); failing that, a
//! range on an index's first column is considered against the ANALYZE
//! selectivity gate, and everything else becomes a sequential scan.
//! Groups that all end up sequential collapse into a single pass with the
//! original OR predicate applied post-fetch.

use itertools::Itertools;
use log::debug;

use crate::analyze::TableStats;
use crate::ast::{
    self, CmpOp, Condition, Join, JoinKind, OneOrMore, Operand, OrderBy, Projection, SelectStmt,
};
use crate::catalog::{Catalog, IndexDef, TableSchema};
use crate::error::{Error, Result};
use crate::key::{CompositeKey, Key, RangeBound, RangeCondition};
use crate::plan::{InnerScan, JoinPlan, OutputColumns, Plan, Scan, ScanKind};
use crate::sql_value::SqlValue;

/// Plan a SELECT.
pub fn plan_select(
    catalog: &Catalog,
    stmt: &SelectStmt,
    stats: Option<&TableStats>,
) -> Result<Plan> {
    let schema = catalog.table(&stmt.table)?;
    let alias = stmt
        .alias
        .clone()
        .unwrap_or_else(|| stmt.table.clone());

    let count_only = stmt.projection.is_count_star();
    if count_only
        && (stmt.limit.is_some() || stmt.offset.is_some() || !stmt.order_by.is_empty())
    {
        return Err(Error::validation(
            "COUNT(*) cannot be combined with LIMIT, OFFSET or ORDER BY",
        ));
    }
    let limit = stmt
        .limit
        .as_ref()
        .map(|v| non_negative(v, "LIMIT"))
        .transpose()?;
    let offset = stmt
        .offset
        .as_ref()
        .map(|v| non_negative(v, "OFFSET"))
        .transpose()?
        .unwrap_or(0);

    let joins = plan_joins(catalog, schema, &alias, &stmt.joins)?;
    let output = resolve_output(schema, &alias, &joins, &stmt.projection)?;

    let mut plan = Plan {
        table: stmt.table.clone(),
        alias: alias.clone(),
        scans: vec![],
        joins,
        post_filters: OneOrMore::default(),
        output,
        count_only,
        order_by: vec![],
        sort_in_memory: false,
        limit,
        offset,
    };

    route_conditions(catalog, schema, &alias, &stmt.conditions, &mut plan, stats)?;
    plan_ordering(catalog, schema, &alias, &stmt.order_by, &mut plan)?;
    Ok(plan)
}

/// Plan the row-selection half of an UPDATE or DELETE: same engine, no
/// joins, no ordering, full rows out.
pub fn plan_mutation(
    catalog: &Catalog,
    table: &str,
    conditions: &OneOrMore,
    stats: Option<&TableStats>,
) -> Result<Plan> {
    let schema = catalog.table(table)?;
    let mut plan = Plan {
        table: table.to_string(),
        alias: table.to_string(),
        scans: vec![],
        joins: vec![],
        post_filters: OneOrMore::default(),
        output: OutputColumns::All,
        count_only: false,
        order_by: vec![],
        sort_in_memory: false,
        limit: None,
        offset: 0,
    };
    route_conditions(catalog, schema, table, conditions, &mut plan, stats)?;
    Ok(plan)
}

fn non_negative(v: &SqlValue, what: &str) -> Result<u64> {
    match v {
        SqlValue::Int4(n) if *n >= 0 => Ok(*n as u64),
        SqlValue::Int8(n) if *n >= 0 => Ok(*n as u64),
        other => Err(Error::validation(format!(
            "{} must be a non-negative integer, got {}",
            what, other
        ))),
    }
}

fn resolve_output(
    schema: &TableSchema,
    alias: &str,
    joins: &[JoinPlan],
    projection: &Projection,
) -> Result<OutputColumns> {
    let names = match projection {
        Projection::Star | Projection::CountStar => return Ok(OutputColumns::All),
        Projection::Columns(names) => names,
    };
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let (qual, col) = ast::split_qualified(name);
        match qual {
            None => {
                schema.column_index(col)?;
                if joins.is_empty() {
                    out.push(col.to_string());
                } else {
                    out.push(format!("{}.{}", alias, col));
                }
            }
            Some(q) if q == alias => {
                schema.column_index(col)?;
                if joins.is_empty() {
                    out.push(col.to_string());
                } else {
                    out.push(format!("{}.{}", alias, col));
                }
            }
            Some(q) => {
                let join = joins
                    .iter()
                    .find(|j| j.alias == q)
                    .ok_or_else(|| Error::validation(format!("unknown alias {} in {}", q, name)))?;
                out.push(format!("{}.{}", join.alias, col));
            }
        }
    }
    Ok(OutputColumns::Named(out))
}

/// Split WHERE atoms between the base table and the join tables, plan the
/// base scans, and record what must wait for the combined row.
fn route_conditions(
    catalog: &Catalog,
    schema: &TableSchema,
    alias: &str,
    conditions: &OneOrMore,
    plan: &mut Plan,
    stats: Option<&TableStats>,
) -> Result<()> {
    let groups: Vec<&Vec<Condition>> =
        conditions.0.iter().filter(|g| !g.is_empty()).collect();

    if plan.joins.is_empty() {
        let mut base_groups = vec![];
        for group in groups {
            let mut normalized = vec![];
            for cond in group {
                normalized.push(normalize_condition(schema, alias, cond.clone())?);
            }
            base_groups.push(normalized);
        }
        plan.scans = plan_scans(catalog, schema, OneOrMore(base_groups), stats)?;
        return Ok(());
    }

    if groups.len() > 1 {
        // OR across aliases cannot be pushed down; evaluate the whole
        // predicate on combined rows instead.
        let mut post = vec![];
        for group in groups {
            let mut g = vec![];
            for cond in group {
                g.push(qualify_condition(catalog, schema, alias, plan, cond.clone())?);
            }
            post.push(g);
        }
        plan.post_filters = OneOrMore(post);
        plan.scans = vec![Scan::sequential(OneOrMore::default())];
        return Ok(());
    }

    // One AND-group: push each atom to its table by alias prefix.
    let mut base_atoms = vec![];
    let mut join_atoms: Vec<Vec<Condition>> = vec![vec![]; plan.joins.len()];
    if let Some(group) = groups.first() {
        for cond in group.iter() {
            let field = cond.field().ok_or_else(|| {
                Error::validation("condition must compare a column".to_string())
            })?;
            let (qual, col) = ast::split_qualified(field);
            match qual {
                None => base_atoms.push(normalize_condition(schema, alias, cond.clone())?),
                Some(q) if q == alias => {
                    base_atoms.push(normalize_condition(schema, alias, cond.clone())?)
                }
                Some(q) => {
                    let pos = plan
                        .joins
                        .iter()
                        .position(|j| j.alias == q)
                        .ok_or_else(|| {
                            Error::validation(format!("unknown alias {} in {}", q, field))
                        })?;
                    let join_schema = catalog.table(&plan.joins[pos].table)?;
                    let mut cond = cond.clone();
                    cond.operand1 = Operand::Field(col.to_string());
                    join_atoms[pos]
                        .push(normalize_condition(join_schema, &plan.joins[pos].alias, cond)?);
                }
            }
        }
    }
    for (pos, atoms) in join_atoms.into_iter().enumerate() {
        if !atoms.is_empty() {
            plan.joins[pos].filters = OneOrMore::single_group(atoms);
        }
    }
    let base = if base_atoms.is_empty() {
        OneOrMore::default()
    } else {
        OneOrMore::single_group(base_atoms)
    };
    plan.scans = plan_scans(catalog, schema, base, stats)?;
    Ok(())
}

/// Re-qualify an atom for evaluation against a combined row.
fn qualify_condition(
    catalog: &Catalog,
    schema: &TableSchema,
    alias: &str,
    plan: &Plan,
    mut cond: Condition,
) -> Result<Condition> {
    let field = cond
        .field()
        .ok_or_else(|| Error::validation("condition must compare a column".to_string()))?;
    let (qual, col) = ast::split_qualified(field);
    let (target_alias, target_schema) = match qual {
        None => (alias.to_string(), schema),
        Some(q) if q == alias => (alias.to_string(), schema),
        Some(q) => {
            let join = plan
                .joins
                .iter()
                .find(|j| j.alias == q)
                .ok_or_else(|| Error::validation(format!("unknown alias {} in {}", q, field)))?;
            (join.alias.clone(), catalog.table(&join.table)?)
        }
    };
    let col = col.to_string();
    cond.operand1 = Operand::Field(col.clone());
    let mut cond = normalize_condition(target_schema, &target_alias, cond)?;
    cond.operand1 = Operand::Field(format!("{}.{}", target_alias, col));
    Ok(cond)
}

/// Put the atom in engine shape: column on the left, literal operands
/// cast to the column's type.
fn normalize_condition(
    schema: &TableSchema,
    alias: &str,
    mut cond: Condition,
) -> Result<Condition> {
    // Flip `literal <op> column` around.
    if !matches!(cond.operand1, Operand::Field(_)) {
        if let Operand::Field(_) = cond.operand2 {
            std::mem::swap(&mut cond.operand1, &mut cond.operand2);
            cond.op = match cond.op {
                CmpOp::Lt => CmpOp::Gt,
                CmpOp::Le => CmpOp::Ge,
                CmpOp::Gt => CmpOp::Lt,
                CmpOp::Ge => CmpOp::Le,
                other => other,
            };
        }
    }
    let field = match &cond.operand1 {
        Operand::Field(f) => f.clone(),
        _ => {
            return Err(Error::validation(
                "condition must compare a column".to_string(),
            ))
        }
    };
    let (qual, col) = ast::split_qualified(&field);
    if let Some(q) = qual {
        if q != alias {
            return Err(Error::validation(format!(
                "alias {} does not name this table",
                q
            )));
        }
    }
    let ty = schema.columns[schema.column_index(col)?].sql_type;
    cond.operand1 = Operand::Field(col.to_string());

    match cond.op {
        CmpOp::IsNull | CmpOp::IsNotNull => {
            cond.operand2 = Operand::Null;
        }
        CmpOp::In | CmpOp::NotIn => {
            let list = match cond.operand2 {
                Operand::List(vs) => vs,
                other => {
                    return Err(Error::validation(format!(
                        "IN requires a value list, got {:?}",
                        other
                    )))
                }
            };
            let cast: Result<Vec<SqlValue>> =
                list.into_iter().map(|v| v.cast_to(ty)).collect();
            cond.operand2 = Operand::List(cast?);
        }
        _ => {
            let v = match cond.operand2 {
                Operand::Literal(v) => v,
                Operand::Null => SqlValue::Null,
                other => {
                    return Err(Error::validation(format!(
                        "{:?} is not a literal operand",
                        other
                    )))
                }
            };
            cond.operand2 = Operand::Literal(v.cast_to(ty)?);
        }
    }
    Ok(cond)
}

/// Plan each OR-group, then collapse all-sequential plans into one pass.
fn plan_scans(
    catalog: &Catalog,
    schema: &TableSchema,
    conditions: OneOrMore,
    stats: Option<&TableStats>,
) -> Result<Vec<Scan>> {
    let indexes = catalog.indexes_of(&schema.name);
    if conditions.is_empty() {
        return Ok(vec![Scan::sequential(OneOrMore::default())]);
    }
    let mut scans = vec![];
    for group in &conditions.0 {
        scans.push(plan_group(schema, &indexes, group, stats)?);
    }
    if scans.iter().all(Scan::is_sequential) {
        // One table pass is enough; the OR predicate filters post-fetch.
        return Ok(vec![Scan::sequential(conditions)]);
    }
    Ok(scans)
}

/// Equality values a group pins a column to, or None on conflicting
/// equalities (which disqualify the group from index use).
fn equality_map(group: &[Condition]) -> Option<Vec<(String, Vec<SqlValue>)>> {
    let mut map: Vec<(String, Vec<SqlValue>)> = vec![];
    for cond in group {
        if !cond.op.is_equality() {
            continue;
        }
        let field = cond.field()?.to_string();
        let values = match (&cond.op, &cond.operand2) {
            (CmpOp::Eq, Operand::Literal(v)) if !v.is_null() => vec![v.clone()],
            (CmpOp::In, Operand::List(vs)) => vs.clone(),
            _ => continue,
        };
        match map.iter_mut().find(|(f, _)| *f == field) {
            Some((_, existing)) => {
                if *existing != values {
                    return None;
                }
            }
            None => map.push((field, values)),
        }
    }
    Some(map)
}

fn plan_group(
    schema: &TableSchema,
    indexes: &[&IndexDef],
    group: &[Condition],
    stats: Option<&TableStats>,
) -> Result<Scan> {
    let full_group = OneOrMore::single_group(group.to_vec());

    let eq_map = match equality_map(group) {
        Some(m) => m,
        None => return Ok(Scan::sequential(full_group)),
    };
    let eq_values = |col: &str| eq_map.iter().find(|(f, _)| f == col).map(|(_, v)| v);

    // Longest equality prefix over the indexes, priority breaking ties.
    let mut best: Option<(&IndexDef, usize)> = None;
    for &idx in indexes {
        for k in (1..=idx.columns.len()).rev() {
            if idx.columns[..k].iter().all(|c| eq_values(c).is_some()) {
                if best.map_or(true, |(_, bk)| k > bk) {
                    best = Some((idx, k));
                }
                break;
            }
        }
    }

    if let Some((idx, k)) = best {
        let value_lists: Vec<Vec<SqlValue>> = idx.columns[..k]
            .iter()
            .map(|c| eq_values(c).expect("prefix matched").clone())
            .collect();
        let product: Vec<Vec<SqlValue>> =
            value_lists.into_iter().multi_cartesian_product().collect();
        let consumed: Vec<&str> = idx.columns[..k].iter().map(String::as_str).collect();
        let filters = residual_filters(group, &consumed, CmpConsumed::Equality);

        if k == idx.columns.len() {
            let keys: Result<Vec<Key>> = product
                .iter()
                .map(|tuple| make_key(idx, tuple))
                .collect();
            debug!("group uses index {} with {} point keys", idx.name, product.len());
            return Ok(Scan {
                kind: ScanKind::IndexPoint {
                    index: idx.name.clone(),
                    keys: keys?,
                },
                filters,
            });
        }
        if product.len() == 1 {
            // Equality on a strict prefix: the half-open composite range
            // `[prefix, prefix++)`.
            let fields: Vec<Key> = product[0].iter().map(Key::from_value).collect();
            let range = RangeCondition::for_prefix(CompositeKey::new(fields));
            debug!("group uses index {} as a prefix range", idx.name);
            return Ok(Scan {
                kind: ScanKind::IndexRange {
                    index: idx.name.clone(),
                    range,
                    reverse: false,
                },
                filters,
            });
        }
        // IN over a strict prefix would need one range per key; not worth
        // the plan shape, scan sequentially.
        return Ok(Scan::sequential(full_group));
    }

    // No equality prefix: a range on some index's first column?
    for &idx in indexes {
        let col = &idx.columns[0];
        let mut lower: Option<(SqlValue, bool)> = None;
        let mut upper: Option<(SqlValue, bool)> = None;
        let mut found = false;
        for cond in group {
            if cond.field() != Some(col.as_str()) {
                continue;
            }
            let (is_lower, inclusive) = match Plan::range_bound_shape(cond.op) {
                Some(shape) => shape,
                None => continue,
            };
            let v = match &cond.operand2 {
                Operand::Literal(v) if !v.is_null() => v.clone(),
                _ => continue,
            };
            found = true;
            if is_lower {
                lower = Some(tighter(lower, (v, inclusive), true));
            } else {
                upper = Some(tighter(upper, (v, inclusive), false));
            }
        }
        if !found {
            continue;
        }
        if !should_use_index_for_range(stats, lower.is_some(), upper.is_some()) {
            debug!(
                "range on {} rejected by selectivity gate, scanning sequentially",
                idx.name
            );
            return Ok(Scan::sequential(full_group));
        }
        let range = bounds_for_index(idx, lower, upper);
        let filters = residual_filters(group, &[col.as_str()], CmpConsumed::Range);
        debug!("group uses index {} as a range scan", idx.name);
        return Ok(Scan {
            kind: ScanKind::IndexRange {
                index: idx.name.clone(),
                range,
                reverse: false,
            },
            filters,
        });
    }

    Ok(Scan::sequential(full_group))
}

enum CmpConsumed {
    Equality,
    Range,
}

/// Atoms of the group not absorbed by the chosen access path.
fn residual_filters(group: &[Condition], consumed: &[&str], what: CmpConsumed) -> OneOrMore {
    let rest: Vec<Condition> = group
        .iter()
        .filter(|cond| {
            let on_consumed_col = cond
                .field()
                .map_or(false, |f| consumed.contains(&f));
            if !on_consumed_col {
                return true;
            }
            match what {
                CmpConsumed::Equality => !cond.op.is_equality(),
                CmpConsumed::Range => !cond.op.is_range(),
            }
        })
        .cloned()
        .collect();
    if rest.is_empty() {
        OneOrMore::default()
    } else {
        OneOrMore::single_group(rest)
    }
}

fn tighter(
    current: Option<(SqlValue, bool)>,
    candidate: (SqlValue, bool),
    is_lower: bool,
) -> (SqlValue, bool) {
    match current {
        None => candidate,
        Some((cv, ci)) => {
            let ord = candidate.0.sort_cmp(&cv);
            let take = match (is_lower, ord) {
                (true, std::cmp::Ordering::Greater) => true,
                (false, std::cmp::Ordering::Less) => true,
                (_, std::cmp::Ordering::Equal) => !candidate.1 && ci,
                _ => false,
            };
            if take {
                candidate
            } else {
                (cv, ci)
            }
        }
    }
}

/// Both bounds: 30%.  One bound: 50%.  Use the index iff the estimate is
/// at or under 30%, or there are no statistics to estimate with.
fn should_use_index_for_range(stats: Option<&TableStats>, lower: bool, upper: bool) -> bool {
    let selectivity = match (lower, upper) {
        (true, true) => 0.30,
        (false, false) => 1.0,
        _ => 0.50,
    };
    match stats {
        Some(st) if st.n_entry > 0 => selectivity <= 0.30,
        _ => true,
    }
}

fn make_key(idx: &IndexDef, tuple: &[SqlValue]) -> Result<Key> {
    if tuple.len() == 1 {
        Ok(Key::from_value(&tuple[0]))
    } else {
        Ok(Key::Composite(CompositeKey::new(
            tuple.iter().map(Key::from_value).collect(),
        )))
    }
}

/// Bounds on an index's first column, lifted to composite form when the
/// index has more columns.
fn bounds_for_index(
    idx: &IndexDef,
    lower: Option<(SqlValue, bool)>,
    upper: Option<(SqlValue, bool)>,
) -> RangeCondition {
    let single = idx.columns.len() == 1;
    let lift = |v: &SqlValue| {
        if single {
            Key::from_value(v)
        } else {
            Key::Composite(CompositeKey::new(vec![Key::from_value(v)]))
        }
    };
    let lower = lower.map(|(v, inclusive)| {
        if single || inclusive {
            RangeBound {
                key: lift(&v),
                inclusive,
            }
        } else {
            // Exclusive lower on a composite prefix: start past every key
            // that begins with the bound value.
            let prefix = CompositeKey::new(vec![Key::from_value(&v)]);
            RangeBound {
                key: Key::Composite(prefix.upper_sentinel()),
                inclusive: true,
            }
        }
    });
    let upper = upper.map(|(v, inclusive)| {
        if single || !inclusive {
            RangeBound {
                key: lift(&v),
                inclusive,
            }
        } else {
            // Inclusive upper on a composite prefix: keep every key that
            // begins with the bound value.
            let prefix = CompositeKey::new(vec![Key::from_value(&v)]);
            RangeBound {
                key: Key::Composite(prefix.upper_sentinel()),
                inclusive: false,
            }
        }
    });
    RangeCondition { lower, upper }
}

/// Switch a compatible scan to index order instead of sorting in memory.
fn plan_ordering(
    catalog: &Catalog,
    schema: &TableSchema,
    alias: &str,
    order_by: &[OrderBy],
    plan: &mut Plan,
) -> Result<()> {
    if order_by.is_empty() {
        return Ok(());
    }
    let mut resolved = vec![];
    for ob in order_by {
        let (qual, col) = ast::split_qualified(&ob.field);
        match qual {
            None => {
                schema.column_index(col)?;
                let field = if plan.joins.is_empty() {
                    col.to_string()
                } else {
                    format!("{}.{}", alias, col)
                };
                resolved.push(OrderBy {
                    field,
                    desc: ob.desc,
                });
            }
            Some(q) if q == alias => {
                schema.column_index(col)?;
                let field = if plan.joins.is_empty() {
                    col.to_string()
                } else {
                    format!("{}.{}", alias, col)
                };
                resolved.push(OrderBy {
                    field,
                    desc: ob.desc,
                });
            }
            Some(q) => {
                let join = plan
                    .joins
                    .iter()
                    .find(|j| j.alias == q)
                    .ok_or_else(|| {
                        Error::validation(format!("unknown alias {} in ORDER BY", q))
                    })?;
                catalog.table(&join.table)?.column_index(col)?;
                resolved.push(OrderBy {
                    field: format!("{}.{}", q, col),
                    desc: ob.desc,
                });
            }
        }
    }
    plan.order_by = resolved;

    // Multi-column ordering, OR-plans and joins always sort in memory.
    if plan.order_by.len() > 1 || plan.scans.len() != 1 || !plan.joins.is_empty() {
        plan.sort_in_memory = true;
        return Ok(());
    }
    let ob = &plan.order_by[0];
    let col = ast::split_qualified(&ob.field).1.to_string();
    let scan = &mut plan.scans[0];
    match &mut scan.kind {
        ScanKind::Sequential => {
            let indexed = catalog
                .indexes_of(&schema.name)
                .into_iter()
                .find(|i| i.columns[0] == col);
            match indexed {
                Some(idx) => {
                    debug!("ORDER BY served by index {}", idx.name);
                    scan.kind = ScanKind::IndexAll {
                        index: idx.name.clone(),
                        reverse: ob.desc,
                    };
                }
                None => plan.sort_in_memory = true,
            }
        }
        ScanKind::IndexRange { index, reverse, .. } => {
            let compatible = catalog
                .index(index)
                .map_or(false, |i| i.columns[0] == col);
            if compatible {
                *reverse = ob.desc;
            } else {
                plan.sort_in_memory = true;
            }
        }
        _ => plan.sort_in_memory = true,
    }
    Ok(())
}

/// Star-shaped equi-join planning: every ON pair links the base table to
/// the join's own table, and the inner side is point-looked-up when an
/// index on the join column exists.
fn plan_joins(
    catalog: &Catalog,
    schema: &TableSchema,
    base_alias: &str,
    joins: &[Join],
) -> Result<Vec<JoinPlan>> {
    if joins.iter().any(|j| j.kind == JoinKind::Right) && joins.len() > 1 {
        return Err(Error::validation(
            "RIGHT JOIN is only supported as the sole join",
        ));
    }
    let mut out: Vec<JoinPlan> = vec![];
    for join in joins {
        let join_schema = catalog.table(&join.table)?;
        let alias = join.alias_or_table().to_string();
        if alias == base_alias || out.iter().any(|j| j.alias == alias) {
            return Err(Error::validation(format!("duplicate alias {}", alias)));
        }
        let mut on = vec![];
        for cond in &join.on {
            let (a, b) = match (&cond.op, &cond.operand1, &cond.operand2) {
                (CmpOp::Eq, Operand::Field(a), Operand::Field(b)) => (a, b),
                _ => {
                    return Err(Error::validation(
                        "joins must be equi-joins on columns".to_string(),
                    ))
                }
            };
            let (qa, ca) = ast::split_qualified(a);
            let (qb, cb) = ast::split_qualified(b);
            let (outer, inner) = match (qa, qb) {
                (Some(x), Some(y)) if x == base_alias && y == alias => (ca, cb),
                (Some(x), Some(y)) if x == alias && y == base_alias => (cb, ca),
                (None, Some(y)) if y == alias => (ca, cb),
                (Some(x), None) if x == alias => (cb, ca),
                _ => {
                    return Err(Error::validation(format!(
                        "join ON must link {} to {}",
                        base_alias, alias
                    )))
                }
            };
            schema.column_index(outer)?;
            join_schema.column_index(inner)?;
            on.push((outer.to_string(), inner.to_string()));
        }
        if on.is_empty() {
            return Err(Error::validation(format!(
                "join on {} needs at least one ON equality",
                alias
            )));
        }
        let scan = catalog
            .indexes_of(&join.table)
            .into_iter()
            .find(|i| i.columns[0] == on[0].1)
            .map(|i| InnerScan::IndexPoint {
                index: i.name.clone(),
            })
            .unwrap_or(InnerScan::Sequential);
        out.push(JoinPlan {
            table: join.table.clone(),
            alias,
            kind: join.kind,
            on,
            scan,
            filters: OneOrMore::default(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, IndexKind, TableSchema};
    use crate::sql_type::SqlType;
    use std::collections::HashMap;

    fn users_catalog() -> Catalog {
        let mut tables = HashMap::new();
        tables.insert(
            String::from("users"),
            TableSchema {
                name: String::from("users"),
                columns: vec![
                    ColumnDef {
                        name: String::from("id"),
                        sql_type: SqlType::Int8,
                        primary_key: true,
                        autoincrement: true,
                        unique: false,
                        nullable: false,
                    },
                    ColumnDef::new("email", SqlType::Varchar(255)),
                    ColumnDef::new("age", SqlType::Int4),
                    ColumnDef::new("created", SqlType::Timestamp),
                ],
                root: 2,
            },
        );
        Catalog {
            tables,
            indexes: vec![
                crate::catalog::IndexDef {
                    name: String::from("users_pk"),
                    table: String::from("users"),
                    kind: IndexKind::Primary,
                    columns: vec![String::from("id")],
                    root: 3,
                },
                crate::catalog::IndexDef {
                    name: String::from("users_email_key"),
                    table: String::from("users"),
                    kind: IndexKind::Unique,
                    columns: vec![String::from("email")],
                    root: 4,
                },
                crate::catalog::IndexDef {
                    name: String::from("users_created"),
                    table: String::from("users"),
                    kind: IndexKind::Secondary,
                    columns: vec![String::from("created")],
                    root: 5,
                },
            ],
        }
    }

    fn select_where(groups: Vec<Vec<Condition>>) -> SelectStmt {
        let mut stmt = SelectStmt::on("users");
        stmt.conditions = OneOrMore(groups);
        stmt
    }

    #[test]
    fn test_equality_picks_best_index() {
        let catalog = users_catalog();
        let stmt = select_where(vec![vec![
            Condition::eq("email", SqlValue::Text(String::from("a@x"))),
            Condition::new("age", CmpOp::Gt, Operand::Literal(SqlValue::Int4(30))),
        ]]);
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        assert_eq!(plan.scans.len(), 1);
        match &plan.scans[0].kind {
            ScanKind::IndexPoint { index, keys } => {
                assert_eq!(index, "users_email_key");
                assert_eq!(keys.len(), 1);
            }
            other => panic!("expected point scan, got {:?}", other),
        }
        // The age atom stays behind as a filter.
        assert_eq!(plan.scans[0].filters.0[0].len(), 1);
        assert_eq!(plan.scans[0].filters.0[0][0].field(), Some("age"));
    }

    #[test]
    fn test_pk_beats_unique_on_ties() {
        let catalog = users_catalog();
        let stmt = select_where(vec![vec![
            Condition::eq("id", SqlValue::Int8(5)),
            Condition::eq("email", SqlValue::Text(String::from("a@x"))),
        ]]);
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        match &plan.scans[0].kind {
            ScanKind::IndexPoint { index, .. } => assert_eq!(index, "users_pk"),
            other => panic!("expected point scan, got {:?}", other),
        }
    }

    #[test]
    fn test_in_list_produces_multiple_keys() {
        let catalog = users_catalog();
        let stmt = select_where(vec![vec![Condition::new(
            "id",
            CmpOp::In,
            Operand::List(vec![
                SqlValue::Int8(1),
                SqlValue::Int8(2),
                SqlValue::Int8(3),
            ]),
        )]]);
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        match &plan.scans[0].kind {
            ScanKind::IndexPoint { keys, .. } => assert_eq!(keys.len(), 3),
            other => panic!("expected point scan, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_equalities_fall_back_to_sequential() {
        let catalog = users_catalog();
        let stmt = select_where(vec![vec![
            Condition::eq("id", SqlValue::Int8(1)),
            Condition::eq("id", SqlValue::Int8(2)),
        ]]);
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        assert!(plan.scans[0].is_sequential());
    }

    #[test]
    fn test_range_without_stats_uses_index() {
        let catalog = users_catalog();
        let stmt = select_where(vec![vec![Condition::new(
            "id",
            CmpOp::Ge,
            Operand::Literal(SqlValue::Int8(100)),
        )]]);
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        assert!(matches!(
            &plan.scans[0].kind,
            ScanKind::IndexRange { index, .. } if index == "users_pk"
        ));
    }

    #[test]
    fn test_selectivity_gate_rejects_half_open_range() {
        let catalog = users_catalog();
        let stats = TableStats {
            n_entry: 1000,
            n_distinct: HashMap::new(),
        };
        let one_bound = select_where(vec![vec![Condition::new(
            "id",
            CmpOp::Ge,
            Operand::Literal(SqlValue::Int8(100)),
        )]]);
        let plan = plan_select(&catalog, &one_bound, Some(&stats)).unwrap();
        assert!(plan.scans[0].is_sequential());

        let both_bounds = select_where(vec![vec![
            Condition::new("id", CmpOp::Ge, Operand::Literal(SqlValue::Int8(100))),
            Condition::new("id", CmpOp::Lt, Operand::Literal(SqlValue::Int8(200))),
        ]]);
        let plan = plan_select(&catalog, &both_bounds, Some(&stats)).unwrap();
        assert!(matches!(plan.scans[0].kind, ScanKind::IndexRange { .. }));
    }

    #[test]
    fn test_or_groups_with_mixed_paths_stay_separate() {
        let catalog = users_catalog();
        let stmt = select_where(vec![
            vec![Condition::eq("id", SqlValue::Int8(1))],
            vec![Condition::new(
                "age",
                CmpOp::Gt,
                Operand::Literal(SqlValue::Int4(60)),
            )],
        ]);
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        assert_eq!(plan.scans.len(), 2);
        assert!(matches!(plan.scans[0].kind, ScanKind::IndexPoint { .. }));
        assert!(plan.scans[1].is_sequential());
    }

    #[test]
    fn test_all_sequential_groups_collapse() {
        let catalog = users_catalog();
        let stmt = select_where(vec![
            vec![Condition::new(
                "age",
                CmpOp::Gt,
                Operand::Literal(SqlValue::Int4(60)),
            )],
            vec![Condition::new(
                "age",
                CmpOp::Lt,
                Operand::Literal(SqlValue::Int4(18)),
            )],
        ]);
        // `age` has no index, so both groups are sequential and merge
        // into one pass keeping the OR.
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        assert_eq!(plan.scans.len(), 1);
        assert!(plan.scans[0].is_sequential());
        assert_eq!(plan.scans[0].filters.0.len(), 2);
    }

    #[test]
    fn test_order_by_pk_switches_to_index_all() {
        let catalog = users_catalog();
        let mut stmt = SelectStmt::on("users");
        stmt.order_by = vec![OrderBy {
            field: String::from("id"),
            desc: true,
        }];
        stmt.limit = Some(SqlValue::Int4(5));
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        assert!(!plan.sort_in_memory);
        assert!(matches!(
            &plan.scans[0].kind,
            ScanKind::IndexAll { index, reverse: true } if index == "users_pk"
        ));
    }

    #[test]
    fn test_order_by_unindexed_sorts_in_memory() {
        let catalog = users_catalog();
        let mut stmt = SelectStmt::on("users");
        stmt.order_by = vec![OrderBy {
            field: String::from("age"),
            desc: false,
        }];
        let plan = plan_select(&catalog, &stmt, None).unwrap();
        assert!(plan.sort_in_memory);
    }

    #[test]
    fn test_count_star_rejects_limit() {
        let catalog = users_catalog();
        let mut stmt = SelectStmt::on("users");
        stmt.projection = Projection::CountStar;
        stmt.limit = Some(SqlValue::Int4(1));
        assert!(matches!(
            plan_select(&catalog, &stmt, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_negative_limit_rejected() {
        let catalog = users_catalog();
        let mut stmt = SelectStmt::on("users");
        stmt.limit = Some(SqlValue::Int4(-1));
        assert!(matches!(
            plan_select(&catalog, &stmt, None),
            Err(Error::Validation(_))
        ));
        let mut stmt = SelectStmt::on("users");
        stmt.offset = Some(SqlValue::Text(String::from("nope")));
        assert!(matches!(
            plan_select(&catalog, &stmt, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_literal_cast_failure_is_type_cast() {
        let catalog = users_catalog();
        let stmt = select_where(vec![vec![Condition::eq(
            "age",
            SqlValue::Text(String::from("abc")),
        )]]);
        assert!(matches!(
            plan_select(&catalog, &stmt, None),
            Err(Error::TypeCast { .. })
        ));
    }
}
