//! Defines an enum of all the possible values that a SQL value can have,
//! plus the explicit runtime casts between them.
//!
//! Values arrive from the client as parsed literals; the engine casts them
//! to the column type once, when the statement is validated, so storage and
//! comparison only ever see the canonical variant for each column.
//! Timestamps are normalized to a single runtime form: microseconds since
//! the Unix epoch, signed.

use chrono::{DateTime, NaiveDateTime};
use enum_as_inner::EnumAsInner;
use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::sql_type::SqlType;

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
/// can hold any value that can be stored in a column, or `NULL`.
pub enum SqlValue {
    Null,
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    /// Microseconds since 1970-01-01T00:00:00Z.
    Time(i64),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(x) => write!(f, "{}", x),
            SqlValue::Int4(x) => write!(f, "{}", x),
            SqlValue::Int8(x) => write!(f, "{}", x),
            SqlValue::Float4(x) => write!(f, "{}", x),
            SqlValue::Float8(x) => write!(f, "{}", x),
            SqlValue::Text(x) => write!(f, "{}", x),
            SqlValue::Time(x) => write!(f, "{}us", x),
        }
    }
}

/// Parse a timestamp literal.  Accepts `YYYY-MM-DD HH:MM:SS[.frac]`,
/// the same with a `T` separator, RFC 3339, or a bare date.
fn parse_timestamp(s: &str) -> Option<i64> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_micros());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_micros());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_micros());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp_micros());
    }
    None
}

impl SqlValue {
    /// Name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Bool(_) => "BOOL",
            SqlValue::Int4(_) => "INT4",
            SqlValue::Int8(_) => "INT8",
            SqlValue::Float4(_) => "FLOAT4",
            SqlValue::Float8(_) => "FLOAT8",
            SqlValue::Text(_) => "TEXT",
            SqlValue::Time(_) => "TIMESTAMP",
        }
    }

    fn cast_err(&self, to: SqlType) -> Error {
        Error::TypeCast {
            from: self.kind_name().to_string(),
            to: to.to_string(),
        }
    }

    /// Cast a parsed literal to the type of the column it is headed for.
    ///
    /// NULL casts to NULL for every target.  Integer widening, int-to-float,
    /// and text-to-timestamp are allowed; anything lossy (float to int,
    /// narrowing out of range, arbitrary text to number) is an error, so a
    /// bad literal fails the statement instead of storing a surprise.
    pub fn cast_to(self, t: SqlType) -> Result<SqlValue> {
        use SqlValue::*;
        match (self, t) {
            (Null, _) => Ok(Null),

            (Bool(b), SqlType::Bool) => Ok(Bool(b)),

            (Int4(i), SqlType::Int4) => Ok(Int4(i)),
            (Int4(i), SqlType::Int8) => Ok(Int8(i as i64)),
            (Int4(i), SqlType::Float4) => Ok(Float4(i as f32)),
            (Int4(i), SqlType::Float8) => Ok(Float8(i as f64)),

            (Int8(i), SqlType::Int8) => Ok(Int8(i)),
            (Int8(i), SqlType::Int4) => match i32::try_from(i) {
                Ok(v) => Ok(Int4(v)),
                Err(_) => Err(Int8(i).cast_err(t)),
            },
            (Int8(i), SqlType::Float8) => Ok(Float8(i as f64)),
            (Int8(i), SqlType::Timestamp) => Ok(Time(i)),

            (Float4(x), SqlType::Float4) => Ok(Float4(x)),
            (Float4(x), SqlType::Float8) => Ok(Float8(x as f64)),
            (Float8(x), SqlType::Float8) => Ok(Float8(x)),

            (Text(s), SqlType::Varchar(limit)) => {
                if s.len() > limit as usize {
                    Err(Error::validation(format!(
                        "value of {} bytes exceeds VARCHAR({})",
                        s.len(),
                        limit
                    )))
                } else {
                    Ok(Text(s))
                }
            }
            (Text(s), SqlType::Text) => {
                if s.len() > crate::MAX_OVERFLOW_TEXT_SIZE {
                    Err(Error::validation(format!(
                        "TEXT value of {} bytes exceeds the {} byte limit",
                        s.len(),
                        crate::MAX_OVERFLOW_TEXT_SIZE
                    )))
                } else {
                    Ok(Text(s))
                }
            }
            (Text(s), SqlType::Timestamp) => match parse_timestamp(&s) {
                Some(us) => Ok(Time(us)),
                None => Err(Text(s).cast_err(t)),
            },

            (Time(us), SqlType::Timestamp) => Ok(Time(us)),

            (v, _) => Err(v.cast_err(t)),
        }
    }

    /// Three-way comparison with SQL NULL below every value.
    ///
    /// Used for ORDER BY and for index key ordering of single columns.
    /// Mixed numeric variants widen before comparing; incomparable kinds
    /// (say TEXT against INT4, which validation should have prevented)
    /// fall back to a fixed variant rank so sorting stays total.
    pub fn sort_cmp(&self, other: &SqlValue) -> Ordering {
        use SqlValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int4(a), Int4(b)) => a.cmp(b),
            (Int8(a), Int8(b)) => a.cmp(b),
            (Int4(a), Int8(b)) => (*a as i64).cmp(b),
            (Int8(a), Int4(b)) => a.cmp(&(*b as i64)),
            (Float4(a), Float4(b)) => a.total_cmp(b),
            (Float8(a), Float8(b)) => a.total_cmp(b),
            (Float4(a), Float8(b)) => (*a as f64).total_cmp(b),
            (Float8(a), Float4(b)) => a.total_cmp(&(*b as f64)),
            (Text(a), Text(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (a, b) => variant_rank(a).cmp(&variant_rank(b)),
        }
    }

    /// SQL equality: NULL never equals anything, including NULL.
    pub fn sql_eq(&self, other: &SqlValue) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self.sort_cmp(other) == Ordering::Equal
    }
}

fn variant_rank(v: &SqlValue) -> u8 {
    match v {
        SqlValue::Null => 0,
        SqlValue::Bool(_) => 1,
        SqlValue::Int4(_) => 2,
        SqlValue::Int8(_) => 3,
        SqlValue::Float4(_) => 4,
        SqlValue::Float8(_) => 5,
        SqlValue::Time(_) => 6,
        SqlValue::Text(_) => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_widening() {
        assert_eq!(
            SqlValue::Int4(7).cast_to(SqlType::Int8).unwrap(),
            SqlValue::Int8(7)
        );
        assert_eq!(
            SqlValue::Int8(7).cast_to(SqlType::Int4).unwrap(),
            SqlValue::Int4(7)
        );
        assert!(SqlValue::Int8(i64::MAX).cast_to(SqlType::Int4).is_err());
        assert_eq!(
            SqlValue::Int4(2).cast_to(SqlType::Float8).unwrap(),
            SqlValue::Float8(2.0)
        );
    }

    #[test]
    fn test_cast_null_is_null_everywhere() {
        for t in [SqlType::Bool, SqlType::Int8, SqlType::Text, SqlType::Timestamp] {
            assert_eq!(SqlValue::Null.cast_to(t).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn test_cast_rejects_lossy() {
        assert!(SqlValue::Float8(1.5).cast_to(SqlType::Int8).is_err());
        assert!(SqlValue::Text(String::from("abc"))
            .cast_to(SqlType::Int4)
            .is_err());
        assert!(SqlValue::Bool(true).cast_to(SqlType::Int4).is_err());
    }

    #[test]
    fn test_varchar_limit() {
        assert!(SqlValue::Text(String::from("toolong"))
            .cast_to(SqlType::Varchar(3))
            .is_err());
        assert_eq!(
            SqlValue::Text(String::from("ok"))
                .cast_to(SqlType::Varchar(3))
                .unwrap(),
            SqlValue::Text(String::from("ok"))
        );
    }

    #[test]
    fn test_timestamp_normalization() {
        let a = SqlValue::Text(String::from("2024-02-01 12:00:00"))
            .cast_to(SqlType::Timestamp)
            .unwrap();
        let b = SqlValue::Text(String::from("2024-02-01T12:00:00+00:00"))
            .cast_to(SqlType::Timestamp)
            .unwrap();
        assert_eq!(a, b);
        assert!(matches!(a, SqlValue::Time(us) if us > 0));
        assert!(SqlValue::Text(String::from("not a time"))
            .cast_to(SqlType::Timestamp)
            .is_err());
    }

    #[test]
    fn test_sort_cmp_null_lowest() {
        assert_eq!(
            SqlValue::Null.sort_cmp(&SqlValue::Int4(i32::MIN)),
            Ordering::Less
        );
        assert_eq!(SqlValue::Null.sort_cmp(&SqlValue::Null), Ordering::Equal);
    }

    #[test]
    fn test_sql_eq_null_semantics() {
        assert!(!SqlValue::Null.sql_eq(&SqlValue::Null));
        assert!(!SqlValue::Int4(1).sql_eq(&SqlValue::Null));
        assert!(SqlValue::Int4(1).sql_eq(&SqlValue::Int8(1)));
    }
}
