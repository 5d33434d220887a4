//! minisql: an embedded, single-file relational database engine.
//!
//! Tables and indexes live in one paged file; a subset of SQL (CREATE
//! TABLE/INDEX, INSERT, SELECT, UPDATE, DELETE, ANALYZE, and explicit
//! transactions) executes against it.  Clients hand in already-parsed
//! [`ast::Statement`] values -- SQL text parsing is an external
//! collaborator -- and get rows back through a pull iterator.
//!
//! ```no_run
//! # fn main() -> minisql::Result<()> {
//! use minisql::{ast, Database};
//!
//! let db = Database::open("app.db?max_cached_pages=200")?;
//! let result = db.execute(&ast::Statement::Select(ast::SelectStmt::on("users")))?;
//! for row in result {
//!     println!("{:?}", row?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod analyze;
pub mod ast;
pub mod btree;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod dbheader;
pub mod error;
pub mod executor;
pub mod index;
pub mod journal;
pub mod key;
pub mod overflow;
pub mod page;
pub mod pager;
pub mod plan;
pub mod planner;
pub mod row;
pub mod sql_type;
pub mod sql_value;
pub mod stmt_cache;
pub mod table;
pub mod transaction;

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;

pub use crate::config::OpenOptions;
pub use crate::error::{Error, Result};
pub use crate::executor::QueryResult;
pub use crate::row::Row;
pub use crate::sql_type::SqlType;
pub use crate::sql_value::SqlValue;
pub use crate::transaction::{CancelToken, Transaction, TxStatus};

use crate::ast::Statement;
use crate::catalog::Catalog;
use crate::journal::Journal;
use crate::pager::Pager;
use crate::stmt_cache::StmtCache;
use crate::transaction::TransactionManager;

/// VARCHAR bytes stored inline in a row cell; longer values (and every
/// TEXT value) move to text-overflow pages.
pub const MAX_INLINE_VARCHAR: usize = 255;
/// Encoded index keys are capped so internal nodes keep a healthy
/// branching factor.
pub const MAX_INDEX_KEY_SIZE: usize = 255;
pub const MAX_COLUMNS: usize = 64;
/// Row-IDs stored inline in a non-unique index cell before spilling to an
/// overflow chain.
pub const MAX_INLINE_ROW_IDS: usize = 4;
pub const MAX_OVERFLOW_TEXT_SIZE: usize = (1 << 24) - 1;

/// One open database file: pager, journal, transaction manager and the
/// prepared-statement cache.  Created by [`Database::open`], destroyed by
/// [`Database::close`] (or drop).
pub struct Database {
    pager: Pager,
    journal: Journal,
    txm: TransactionManager,
    stmt_cache: RefCell<StmtCache>,
    options: OpenOptions,
    /// The statement-level BEGIN/COMMIT transaction, when one is open.
    active: RefCell<Option<Transaction>>,
}

fn is_mutating(stmt: &Statement) -> bool {
    matches!(
        stmt,
        Statement::Insert(_)
            | Statement::Update(_)
            | Statement::Delete(_)
            | Statement::CreateTable(_)
            | Statement::CreateIndex(_)
            | Statement::DropTable(_)
            | Statement::DropIndex(_)
            | Statement::Analyze(_)
    )
}

impl Database {
    /// Open (or create) a database from a connection string,
    /// `path[?journal=…&log_level=…&max_cached_pages=…]`.
    pub fn open(conn: &str) -> Result<Database> {
        Database::open_with_options(OpenOptions::from_str(conn)?)
    }

    pub fn open_with_options(options: OpenOptions) -> Result<Database> {
        let path = Path::new(&options.path);
        // I7: a non-empty journal is replayed before any other I/O.
        if path.exists() {
            journal::recover(path)?;
        }
        let pager = Pager::open(path, options.max_cached_pages)?;
        let journal = Journal::new(path, options.journal);
        let db = Database {
            pager,
            journal,
            txm: TransactionManager::new(),
            stmt_cache: RefCell::new(StmtCache::default()),
            options,
            active: RefCell::new(None),
        };
        db.bootstrap()?;
        Ok(db)
    }

    /// Make sure the statistics table exists; fresh files get it on first
    /// open.
    fn bootstrap(&self) -> Result<()> {
        let mut tx = self.txm.begin();
        let cat = Catalog::load(&self.pager, &mut tx)?;
        if cat.tables.contains_key(catalog::STAT_TABLE_NAME) {
            tx.abort();
            return Ok(());
        }
        executor::create_table_raw(
            &self.pager,
            &mut tx,
            catalog::STAT_TABLE_NAME,
            &catalog::STAT_COLUMNS,
        )?;
        tx.commit(&self.pager, &self.journal)
    }

    /// The log level requested in the connection string; embedders apply
    /// it to their `log` backend.
    pub fn log_level(&self) -> log::LevelFilter {
        self.options.log_level
    }

    /// Start a programmatic transaction.  Statement-level BEGIN/COMMIT
    /// via [`Database::execute`] manages its own.
    pub fn begin(&self) -> Transaction {
        self.txm.begin()
    }

    pub fn commit(&self, tx: &mut Transaction) -> Result<()> {
        tx.commit(&self.pager, &self.journal)
    }

    pub fn rollback(&self, tx: &mut Transaction) {
        tx.abort()
    }

    /// Run one statement inside an open transaction.  A failed statement
    /// rolls back to its own savepoint and leaves the transaction usable;
    /// cancellation aborts the whole transaction.
    pub fn execute_in(&self, tx: &mut Transaction, stmt: &Statement) -> Result<QueryResult> {
        if matches!(
            stmt,
            Statement::Begin | Statement::Commit | Statement::Rollback
        ) {
            return Err(Error::validation(
                "transaction control cannot nest inside an open transaction",
            ));
        }
        if is_mutating(stmt) {
            tx.claim_writer()?;
        }
        let sp = tx.savepoint();
        match executor::execute_statement(&self.pager, tx, stmt) {
            Ok(result) => Ok(result),
            Err(Error::Cancelled) => {
                tx.abort();
                Err(Error::Cancelled)
            }
            Err(e) => {
                tx.rollback_to(sp);
                Err(e)
            }
        }
    }

    /// Execute a statement.  Outside BEGIN/COMMIT each statement runs in
    /// its own transaction, committed on success and aborted on error.
    pub fn execute(&self, stmt: &Statement) -> Result<QueryResult> {
        self.execute_with(stmt, CancelToken::new())
    }

    pub fn execute_with(&self, stmt: &Statement, cancel: CancelToken) -> Result<QueryResult> {
        match stmt {
            Statement::Begin => {
                let mut active = self.active.borrow_mut();
                if active.is_some() {
                    return Err(Error::validation("a transaction is already open"));
                }
                *active = Some(self.txm.begin_with(cancel));
                Ok(QueryResult::empty())
            }
            Statement::Commit => {
                let mut tx = self
                    .active
                    .borrow_mut()
                    .take()
                    .ok_or_else(|| Error::validation("no open transaction to commit"))?;
                tx.commit(&self.pager, &self.journal)?;
                Ok(QueryResult::empty())
            }
            Statement::Rollback => {
                let mut tx = self
                    .active
                    .borrow_mut()
                    .take()
                    .ok_or_else(|| Error::validation("no open transaction to roll back"))?;
                tx.abort();
                Ok(QueryResult::empty())
            }
            _ => {
                let mut active = self.active.borrow_mut();
                if let Some(tx) = active.as_mut() {
                    let result = self.execute_in(tx, stmt);
                    if tx.status() != TxStatus::Active {
                        *active = None;
                    }
                    return result;
                }
                drop(active);
                let mut tx = self.txm.begin_with(cancel);
                match self.execute_in(&mut tx, stmt) {
                    Ok(result) => {
                        tx.commit(&self.pager, &self.journal)?;
                        Ok(result)
                    }
                    Err(e) => {
                        tx.abort();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Look up (or parse and cache) the statement for a SQL string.  The
    /// parser is the external collaborator; the LRU is ours.
    pub fn prepare(
        &self,
        sql: &str,
        parse: impl FnOnce(&str) -> Result<Statement>,
    ) -> Result<Rc<Statement>> {
        if let Some(stmt) = self.stmt_cache.borrow_mut().get(sql) {
            return Ok(stmt);
        }
        let stmt = parse(sql)?;
        Ok(self.stmt_cache.borrow_mut().insert(sql.to_string(), stmt))
    }

    /// Clean shutdown: abort any open transaction and truncate the
    /// journal.
    pub fn close(self) -> Result<()> {
        if let Some(mut tx) = self.active.borrow_mut().take() {
            tx.abort();
        }
        self.journal.truncate()
    }
}
