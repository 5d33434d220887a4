//! LRU cache of prepared statements, keyed by SQL text.
//!
//! Parsing is external; the engine just remembers the structured
//! statement a given SQL string produced so repeated prepares skip the
//! parse.  Eviction mirrors the pager's LRU: a monotonic tick per touch,
//! oldest out first.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::Statement;

pub const STMT_CACHE_CAPACITY: usize = 100;

struct Entry {
    stmt: Rc<Statement>,
    last_used: u64,
}

pub struct StmtCache {
    map: HashMap<String, Entry>,
    capacity: usize,
    tick: u64,
}

impl Default for StmtCache {
    fn default() -> Self {
        StmtCache::with_capacity(STMT_CACHE_CAPACITY)
    }
}

impl StmtCache {
    pub fn with_capacity(capacity: usize) -> StmtCache {
        StmtCache {
            map: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, sql: &str) -> Option<Rc<Statement>> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(sql).map(|e| {
            e.last_used = tick;
            Rc::clone(&e.stmt)
        })
    }

    pub fn insert(&mut self, sql: String, stmt: Statement) -> Rc<Statement> {
        self.tick += 1;
        let stmt = Rc::new(stmt);
        self.map.insert(
            sql,
            Entry {
                stmt: Rc::clone(&stmt),
                last_used: self.tick,
            },
        );
        while self.map.len() > self.capacity {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
                .expect("non-empty cache");
            self.map.remove(&oldest);
        }
        stmt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_evicts_oldest() {
        let mut cache = StmtCache::with_capacity(2);
        cache.insert(String::from("a"), Statement::Begin);
        cache.insert(String::from("b"), Statement::Commit);
        // Touch `a` so `b` is the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.insert(String::from("c"), Statement::Rollback);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_same_sql_returns_same_statement() {
        let mut cache = StmtCache::default();
        let first = cache.insert(String::from("begin"), Statement::Begin);
        let again = cache.get("begin").unwrap();
        assert!(Rc::ptr_eq(&first, &again));
    }
}
