//! The schema catalog: `minisql_master` holds one row per user table and
//! per index; `minisql_stat` holds ANALYZE output.
//!
//! Master rows are `(name, kind, parent, ddl, root)` where `ddl` is the
//! serialized column-descriptor list for tables and the indexed-column
//! list for indexes, and `root` is the object's root page.  The master
//! tree's own root page is pinned in the database header, and root pages
//! never move (see the btree module), so a catalog row stays valid for the
//! life of its object.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::str::FromStr;

use crate::btree::tree::{BTree, TableTree};
use crate::error::{Error, Result};
use crate::overflow;
use crate::pager::{PageIdx, Pager};
use crate::row::{self, CellValue};
use crate::sql_type::SqlType;
use crate::sql_value::SqlValue;
use crate::transaction::Transaction;

pub const MASTER_TABLE_NAME: &str = "minisql_master";
pub const STAT_TABLE_NAME: &str = "minisql_stat";

const KIND_TABLE: &str = "table";
const KIND_INDEX: &str = "index";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub unique: bool,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: SqlType) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            sql_type,
            primary_key: false,
            autoincrement: false,
            unique: false,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKind {
    /// Planner priority order: PK beats unique beats secondary.
    Primary,
    Unique,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub kind: IndexKind,
    pub columns: Vec<String>,
    pub root: PageIdx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub root: PageIdx,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::validation(format!("no column {} in {}", name, self.name)))
    }

    pub fn column_types(&self) -> Vec<SqlType> {
        self.columns.iter().map(|c| c.sql_type).collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

lazy_static! {
    /// Columns of `minisql_master` itself; it is stored like any table.
    pub static ref MASTER_COLUMNS: Vec<ColumnDef> = vec![
        ColumnDef::new("name", SqlType::Varchar(128)),
        ColumnDef::new("kind", SqlType::Varchar(16)),
        ColumnDef::new("parent", SqlType::Varchar(128)),
        ColumnDef::new("ddl", SqlType::Text),
        ColumnDef::new("root", SqlType::Int8),
    ];
    /// Columns of `minisql_stat`: `(tbl, idx?, val)`.
    pub static ref STAT_COLUMNS: Vec<ColumnDef> = vec![
        ColumnDef::new("tbl", SqlType::Varchar(128)),
        ColumnDef::new("idx", SqlType::Varchar(128)),
        ColumnDef::new("val", SqlType::Varchar(255)),
    ];
}

/// Serialize column descriptors:
/// `name:TYPE[:pk][:autoinc][:unique][:notnull]`, comma-joined.
pub fn columns_to_ddl(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| {
            let mut s = format!("{}:{}", c.name, c.sql_type);
            if c.primary_key {
                s.push_str(":pk");
            }
            if c.autoincrement {
                s.push_str(":autoinc");
            }
            if c.unique {
                s.push_str(":unique");
            }
            if !c.nullable {
                s.push_str(":notnull");
            }
            s
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn ddl_to_columns(ddl: &str) -> Result<Vec<ColumnDef>> {
    let mut out = vec![];
    for part in ddl.split(',') {
        let mut fields = part.split(':');
        let name = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::corrupt(format!("bad column descriptor {:?}", part)))?;
        let ty = fields
            .next()
            .and_then(|s| SqlType::from_str(s).ok())
            .ok_or_else(|| Error::corrupt(format!("bad column type in {:?}", part)))?;
        let mut col = ColumnDef::new(name, ty);
        for flag in fields {
            match flag {
                "pk" => col.primary_key = true,
                "autoinc" => col.autoincrement = true,
                "unique" => col.unique = true,
                "notnull" => col.nullable = false,
                other => {
                    return Err(Error::corrupt(format!("bad column flag {:?}", other)))
                }
            }
        }
        out.push(col);
    }
    Ok(out)
}

fn index_kind_tag(kind: IndexKind) -> &'static str {
    match kind {
        IndexKind::Primary => "primary",
        IndexKind::Unique => "unique",
        IndexKind::Secondary => "secondary",
    }
}

/// Serialize an index descriptor: `kind:col1,col2,…`.
pub fn index_to_ddl(kind: IndexKind, columns: &[String]) -> String {
    format!("{}:{}", index_kind_tag(kind), columns.join(","))
}

pub fn ddl_to_index(ddl: &str) -> Result<(IndexKind, Vec<String>)> {
    let (kind, cols) = ddl
        .split_once(':')
        .ok_or_else(|| Error::corrupt(format!("bad index descriptor {:?}", ddl)))?;
    let kind = match kind {
        "primary" => IndexKind::Primary,
        "unique" => IndexKind::Unique,
        "secondary" => IndexKind::Secondary,
        other => return Err(Error::corrupt(format!("bad index kind {:?}", other))),
    };
    let columns: Vec<String> = cols.split(',').map(str::to_string).collect();
    if columns.iter().any(String::is_empty) {
        return Err(Error::corrupt(format!("bad index columns {:?}", cols)));
    }
    Ok((kind, columns))
}

/// Identifiers end up inside the ddl text, so the separators are reserved.
pub fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::validation(format!(
            "identifier {:?} must be 1..=128 characters",
            name
        )));
    }
    if name.contains(':') || name.contains(',') || name.contains('.') {
        return Err(Error::validation(format!(
            "identifier {:?} may not contain ':', ',' or '.'",
            name
        )));
    }
    Ok(())
}

/// The catalog as loaded within one transaction.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tables: HashMap<String, TableSchema>,
    pub indexes: Vec<IndexDef>,
}

impl Catalog {
    /// Scan `minisql_master` and build the in-memory catalog.  Reading
    /// through the transaction means schema changes conflict like any
    /// other page write.
    pub fn load(pager: &Pager, tx: &mut Transaction) -> Result<Catalog> {
        let root = pager.header_for(tx).catalog_root;
        let tree: BTree<TableTree> = BTree::new(pager, root);
        let types: Vec<SqlType> = MASTER_COLUMNS.iter().map(|c| c.sql_type).collect();

        let mut rows = vec![];
        let mut cursor = tree.scan_forward(tx, None, None)?;
        while let Some((_, data)) = cursor.next(&tree, tx)? {
            rows.push(data);
        }

        let mut catalog = Catalog::default();
        for data in rows {
            let cells = row::unmarshal_row(&data, &types, None)?;
            let name = text_cell(pager, tx, &cells[0])?;
            let kind = text_cell(pager, tx, &cells[1])?;
            let parent = text_cell(pager, tx, &cells[2])?;
            let ddl = text_cell(pager, tx, &cells[3])?;
            let root = match &cells[4] {
                CellValue::Inline(SqlValue::Int8(r)) => *r as PageIdx,
                other => {
                    return Err(Error::corrupt(format!(
                        "master row {} has root {:?}",
                        name, other
                    )))
                }
            };
            match kind.as_str() {
                KIND_TABLE => {
                    catalog.tables.insert(
                        name.clone(),
                        TableSchema {
                            name,
                            columns: ddl_to_columns(&ddl)?,
                            root,
                        },
                    );
                }
                KIND_INDEX => {
                    let (kind, columns) = ddl_to_index(&ddl)?;
                    catalog.indexes.push(IndexDef {
                        name,
                        table: parent,
                        kind,
                        columns,
                        root,
                    });
                }
                other => {
                    return Err(Error::corrupt(format!("master row kind {:?}", other)))
                }
            }
        }
        Ok(catalog)
    }

    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("table {}", name)))
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Indexes of one table in planner priority order.
    pub fn indexes_of(&self, table: &str) -> Vec<&IndexDef> {
        let mut out: Vec<&IndexDef> = self
            .indexes
            .iter()
            .filter(|i| i.table == table)
            .collect();
        out.sort_by_key(|i| i.kind);
        out
    }
}

/// Master-row values for a table.
pub fn master_row_for_table(name: &str, columns: &[ColumnDef], root: PageIdx) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(name.to_string()),
        SqlValue::Text(KIND_TABLE.to_string()),
        SqlValue::Text(String::new()),
        SqlValue::Text(columns_to_ddl(columns)),
        SqlValue::Int8(root as i64),
    ]
}

/// Master-row values for an index.
pub fn master_row_for_index(def: &IndexDef) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(def.name.clone()),
        SqlValue::Text(KIND_INDEX.to_string()),
        SqlValue::Text(def.table.clone()),
        SqlValue::Text(index_to_ddl(def.kind, &def.columns)),
        SqlValue::Int8(def.root as i64),
    ]
}

fn text_cell(pager: &Pager, tx: &mut Transaction, cell: &CellValue) -> Result<String> {
    match cell {
        CellValue::Inline(SqlValue::Text(s)) => Ok(s.clone()),
        CellValue::Inline(SqlValue::Null) => Ok(String::new()),
        CellValue::TextPtr { len, first_page } => {
            let bytes = overflow::read_text_chain(pager, tx, *first_page, *len)?;
            String::from_utf8(bytes)
                .map_err(|e| Error::corrupt(format!("invalid utf-8 in catalog: {}", e)))
        }
        other => Err(Error::corrupt(format!("expected text cell, got {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_ddl_round_trip() {
        let columns = vec![
            ColumnDef {
                name: String::from("id"),
                sql_type: SqlType::Int8,
                primary_key: true,
                autoincrement: true,
                unique: false,
                nullable: false,
            },
            ColumnDef {
                name: String::from("email"),
                sql_type: SqlType::Varchar(255),
                primary_key: false,
                autoincrement: false,
                unique: true,
                nullable: true,
            },
            ColumnDef::new("age", SqlType::Int4),
        ];
        let ddl = columns_to_ddl(&columns);
        assert_eq!(ddl_to_columns(&ddl).unwrap(), columns);
    }

    #[test]
    fn test_index_ddl_round_trip() {
        let cols = vec![String::from("country"), String::from("city")];
        let ddl = index_to_ddl(IndexKind::Primary, &cols);
        assert_eq!(ddl_to_index(&ddl).unwrap(), (IndexKind::Primary, cols));
        assert!(ddl_to_index("wat").is_err());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(check_identifier("users").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("a:b").is_err());
        assert!(check_identifier("a,b").is_err());
        assert!(check_identifier("a.b").is_err());
    }

    #[test]
    fn test_index_priority_order() {
        let mk = |name: &str, kind| IndexDef {
            name: name.to_string(),
            table: String::from("t"),
            kind,
            columns: vec![String::from("c")],
            root: 2,
        };
        let catalog = Catalog {
            tables: HashMap::new(),
            indexes: vec![
                mk("sec", IndexKind::Secondary),
                mk("pk", IndexKind::Primary),
                mk("uq", IndexKind::Unique),
            ],
        };
        let names: Vec<&str> = catalog
            .indexes_of("t")
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        assert_eq!(names, vec!["pk", "uq", "sec"]);
    }
}
