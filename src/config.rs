//! Connection-string parsing: `path[?k=v&…]`.
//!
//! Recognised options: `journal` (default true), `log_level` (default
//! warn), `max_cached_pages` (default 1000).  Unknown keys are errors so
//! typos surface at open time instead of silently using defaults.

use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub path: String,
    pub journal: bool,
    pub log_level: log::LevelFilter,
    pub max_cached_pages: usize,
}

impl OpenOptions {
    pub fn new(path: &str) -> OpenOptions {
        OpenOptions {
            path: path.to_string(),
            journal: true,
            log_level: log::LevelFilter::Warn,
            max_cached_pages: 1000,
        }
    }
}

impl FromStr for OpenOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<OpenOptions> {
        let (path, query) = match s.split_once('?') {
            None => (s, ""),
            Some((p, q)) => (p, q),
        };
        if path.is_empty() {
            return Err(Error::validation("connection string needs a file path"));
        }
        let mut opts = OpenOptions::new(path);
        if query.is_empty() {
            return Ok(opts);
        }
        for pair in query.split('&') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::validation(format!("malformed option {:?}", pair)))?;
            match key {
                "journal" => {
                    opts.journal = match value {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(Error::validation(format!(
                                "journal must be true or false, got {:?}",
                                other
                            )))
                        }
                    }
                }
                "log_level" => {
                    opts.log_level = match value {
                        "debug" => log::LevelFilter::Debug,
                        "info" => log::LevelFilter::Info,
                        "warn" => log::LevelFilter::Warn,
                        "error" => log::LevelFilter::Error,
                        other => {
                            return Err(Error::validation(format!(
                                "unknown log_level {:?}",
                                other
                            )))
                        }
                    }
                }
                "max_cached_pages" => {
                    opts.max_cached_pages = value.parse::<usize>().map_err(|_| {
                        Error::validation(format!(
                            "max_cached_pages must be a non-negative integer, got {:?}",
                            value
                        ))
                    })?;
                }
                other => {
                    return Err(Error::validation(format!(
                        "unknown connection option {:?}",
                        other
                    )))
                }
            }
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = OpenOptions::from_str("/tmp/my.db").unwrap();
        assert_eq!(opts.path, "/tmp/my.db");
        assert!(opts.journal);
        assert_eq!(opts.log_level, log::LevelFilter::Warn);
        assert_eq!(opts.max_cached_pages, 1000);
    }

    #[test]
    fn test_all_options() {
        let opts = OpenOptions::from_str(
            "data.db?journal=false&log_level=debug&max_cached_pages=50",
        )
        .unwrap();
        assert!(!opts.journal);
        assert_eq!(opts.log_level, log::LevelFilter::Debug);
        assert_eq!(opts.max_cached_pages, 50);
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        assert!(matches!(
            OpenOptions::from_str("data.db?jurnal=false"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            OpenOptions::from_str("data.db?journal=maybe"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            OpenOptions::from_str("data.db?max_cached_pages=-3"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            OpenOptions::from_str("?journal=true"),
            Err(Error::Validation(_))
        ));
    }
}
