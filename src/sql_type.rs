//! Defines an enum of the supported SQL column types and routines for conversion to and from string.
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// These are the SQL column types that we support.
/// `VARCHAR(n)` carries its declared limit; values longer than 255 bytes
/// spill to text-overflow pages, as do all `TEXT` values.
pub enum SqlType {
    Bool,
    Int4,
    Int8,
    Float4,
    Float8,
    Varchar(u32),
    Text,
    Timestamp,
}

impl SqlType {
    /// True for VARCHAR and TEXT, the kinds that may need overflow pages.
    pub fn is_textual(&self) -> bool {
        matches!(self, SqlType::Varchar(_) | SqlType::Text)
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlType::Bool => write!(f, "BOOL"),
            SqlType::Int4 => write!(f, "INT4"),
            SqlType::Int8 => write!(f, "INT8"),
            SqlType::Float4 => write!(f, "FLOAT4"),
            SqlType::Float8 => write!(f, "FLOAT8"),
            SqlType::Varchar(n) => write!(f, "VARCHAR({})", n),
            SqlType::Text => write!(f, "TEXT"),
            SqlType::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSqlTypeError;

impl FromStr for SqlType {
    type Err = ParseSqlTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        if let Some(rest) = upper.strip_prefix("VARCHAR(") {
            let n = rest
                .strip_suffix(')')
                .and_then(|digits| digits.parse::<u32>().ok())
                .ok_or(ParseSqlTypeError)?;
            return Ok(SqlType::Varchar(n));
        }
        match upper.as_str() {
            "BOOL" => Ok(SqlType::Bool),
            "INT4" => Ok(SqlType::Int4),
            "INT8" => Ok(SqlType::Int8),
            "FLOAT4" => Ok(SqlType::Float4),
            "FLOAT8" => Ok(SqlType::Float8),
            "TEXT" => Ok(SqlType::Text),
            "TIMESTAMP" => Ok(SqlType::Timestamp),
            _ => Err(ParseSqlTypeError),
        }
    }
}

#[test]
fn test_display_from_str_round_trip() {
    let cases = [
        SqlType::Bool,
        SqlType::Int4,
        SqlType::Int8,
        SqlType::Float4,
        SqlType::Float8,
        SqlType::Varchar(255),
        SqlType::Text,
        SqlType::Timestamp,
    ];
    for case in cases {
        assert_eq!(SqlType::from_str(&case.to_string()), Ok(case));
    }
}

#[test]
fn test_from_str_rejects_unknown() {
    assert!(SqlType::from_str("BLOB").is_err());
    assert!(SqlType::from_str("VARCHAR(abc)").is_err());
    assert!(SqlType::from_str("VARCHAR(").is_err());
}
