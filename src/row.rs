//! Row cell marshalling: null bitmask, fixed-width scalars, and text that
//! is either inlined or swapped for a pointer into the overflow chain.
//!
//! A row cell's payload is `null_mask[8] | values…` with the values in
//! declared column order and NULL columns contributing no bytes.  VARCHAR
//! is inlined up to 255 bytes and replaced by `length | first_page` above
//! that; TEXT always stores a pointer.  Decoding is schema-driven, so the
//! two forms never collide.

use std::io::Cursor;

use crate::codec;
use crate::error::{Error, Result};
use crate::pager::PageIdx;
use crate::sql_type::SqlType;
use crate::sql_value::SqlValue;

/// A decoded row: its 64-bit identifier plus one value per column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub row_id: u64,
    pub items: Vec<SqlValue>,
}

/// One column slot of a row cell.  Text longer than the inline limit (and
/// every TEXT value) is a pointer; the table layer resolves it against the
/// overflow chain.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Inline(SqlValue),
    TextPtr { len: u32, first_page: PageIdx },
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Inline(SqlValue::Null))
    }
}

/// The serialized payload of a table-leaf cell.
#[derive(Debug, Clone, PartialEq)]
pub struct RowData(pub Vec<u8>);

fn fixed_size(t: SqlType) -> usize {
    match t {
        SqlType::Bool => 1,
        SqlType::Int4 | SqlType::Float4 => 4,
        SqlType::Int8 | SqlType::Float8 | SqlType::Timestamp => 8,
        SqlType::Varchar(_) | SqlType::Text => 0,
    }
}

/// Serialize one row's cell values.  Callers are responsible for having
/// already swapped oversized text for `TextPtr`s.
pub fn marshal_row(values: &[CellValue], types: &[SqlType]) -> Result<RowData> {
    if values.len() != types.len() {
        return Err(Error::internal(format!(
            "row has {} values for {} columns",
            values.len(),
            types.len()
        )));
    }
    let mut mask = 0_u64;
    for (i, v) in values.iter().enumerate() {
        if v.is_null() {
            mask |= 1 << i;
        }
    }
    let mut buf = vec![];
    codec::write_u64(&mut buf, mask);
    for (v, t) in values.iter().zip(types.iter()) {
        match v {
            CellValue::Inline(SqlValue::Null) => {}
            CellValue::Inline(val) => marshal_value(&mut buf, val, *t)?,
            CellValue::TextPtr { len, first_page } => {
                if !t.is_textual() {
                    return Err(Error::internal(format!("text pointer in {} column", t)));
                }
                codec::write_u32(&mut buf, *len);
                codec::write_u32(&mut buf, *first_page);
            }
        }
    }
    Ok(RowData(buf))
}

fn marshal_value(buf: &mut Vec<u8>, v: &SqlValue, t: SqlType) -> Result<()> {
    match (v, t) {
        (SqlValue::Bool(b), SqlType::Bool) => codec::write_bool(buf, *b),
        (SqlValue::Int4(i), SqlType::Int4) => codec::write_i32(buf, *i),
        (SqlValue::Int8(i), SqlType::Int8) => codec::write_i64(buf, *i),
        (SqlValue::Float4(x), SqlType::Float4) => codec::write_f32(buf, *x),
        (SqlValue::Float8(x), SqlType::Float8) => codec::write_f64(buf, *x),
        (SqlValue::Time(us), SqlType::Timestamp) => codec::write_i64(buf, *us),
        (SqlValue::Text(s), SqlType::Varchar(_)) => {
            if s.len() > crate::MAX_INLINE_VARCHAR {
                return Err(Error::internal(
                    "un-overflowed varchar longer than the inline limit",
                ));
            }
            codec::write_str(buf, s);
        }
        (SqlValue::Text(_), SqlType::Text) => {
            return Err(Error::internal("TEXT value was not given an overflow page"))
        }
        (v, t) => {
            return Err(Error::internal(format!(
                "value kind {} does not match column type {}",
                v.kind_name(),
                t
            )))
        }
    }
    Ok(())
}

/// Decode a row cell payload.  With `wanted = Some(cols)` only those column
/// indices are materialised; the rest decode to NULL without copying their
/// bytes.  The null bitmask decides which slots contribute bytes at all.
pub fn unmarshal_row(
    data: &RowData,
    types: &[SqlType],
    wanted: Option<&[usize]>,
) -> Result<Vec<CellValue>> {
    let mut c = Cursor::new(data.0.as_slice());
    let mask = codec::read_u64(&mut c)?;
    let mut out = Vec::with_capacity(types.len());
    for (i, t) in types.iter().enumerate() {
        let null = mask & (1 << i) != 0;
        let want = wanted.map_or(true, |w| w.contains(&i));
        if null {
            out.push(CellValue::Inline(SqlValue::Null));
            continue;
        }
        if !t.is_textual() {
            if want {
                out.push(CellValue::Inline(unmarshal_fixed(&mut c, *t)?));
            } else {
                codec::skip(&mut c, fixed_size(*t))?;
                out.push(CellValue::Inline(SqlValue::Null));
            }
            continue;
        }
        // Textual: a 4-byte length, then inline bytes or a page pointer.
        let len = codec::read_u32(&mut c)?;
        let inline = matches!(t, SqlType::Varchar(_)) && len as usize <= crate::MAX_INLINE_VARCHAR;
        if inline {
            if want {
                let bytes = codec::read_exact(&mut c, len as usize)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| Error::corrupt(format!("invalid utf-8 in row: {}", e)))?;
                out.push(CellValue::Inline(SqlValue::Text(s)));
            } else {
                codec::skip(&mut c, len as usize)?;
                out.push(CellValue::Inline(SqlValue::Null));
            }
        } else {
            let first_page = codec::read_u32(&mut c)?;
            if want {
                out.push(CellValue::TextPtr { len, first_page });
            } else {
                out.push(CellValue::Inline(SqlValue::Null));
            }
        }
    }
    Ok(out)
}

fn unmarshal_fixed(c: &mut Cursor<&[u8]>, t: SqlType) -> Result<SqlValue> {
    Ok(match t {
        SqlType::Bool => SqlValue::Bool(codec::read_bool(c)?),
        SqlType::Int4 => SqlValue::Int4(codec::read_i32(c)?),
        SqlType::Int8 => SqlValue::Int8(codec::read_i64(c)?),
        SqlType::Float4 => SqlValue::Float4(codec::read_f32(c)?),
        SqlType::Float8 => SqlValue::Float8(codec::read_f64(c)?),
        SqlType::Timestamp => SqlValue::Time(codec::read_i64(c)?),
        SqlType::Varchar(_) | SqlType::Text => {
            return Err(Error::internal("textual type in fixed decode"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<SqlType> {
        vec![
            SqlType::Int8,
            SqlType::Varchar(255),
            SqlType::Bool,
            SqlType::Float8,
        ]
    }

    fn values() -> Vec<CellValue> {
        vec![
            CellValue::Inline(SqlValue::Int8(42)),
            CellValue::Inline(SqlValue::Text(String::from("forty-two"))),
            CellValue::Inline(SqlValue::Null),
            CellValue::Inline(SqlValue::Float8(0.5)),
        ]
    }

    #[test]
    fn test_row_round_trip() {
        let data = marshal_row(&values(), &schema()).unwrap();
        let back = unmarshal_row(&data, &schema(), None).unwrap();
        assert_eq!(back, values());
    }

    #[test]
    fn test_partial_unmarshal_leaves_null() {
        let data = marshal_row(&values(), &schema()).unwrap();
        let back = unmarshal_row(&data, &schema(), Some(&[1, 3])).unwrap();
        assert_eq!(back[0], CellValue::Inline(SqlValue::Null));
        assert_eq!(
            back[1],
            CellValue::Inline(SqlValue::Text(String::from("forty-two")))
        );
        assert_eq!(back[2], CellValue::Inline(SqlValue::Null));
        assert_eq!(back[3], CellValue::Inline(SqlValue::Float8(0.5)));
    }

    #[test]
    fn test_text_pointer_round_trip() {
        let types = vec![SqlType::Text];
        let vals = vec![CellValue::TextPtr {
            len: 9000,
            first_page: 12,
        }];
        let data = marshal_row(&vals, &types).unwrap();
        let back = unmarshal_row(&data, &types, None).unwrap();
        assert_eq!(back, vals);
    }

    #[test]
    fn test_unoverflowed_text_is_rejected() {
        let types = vec![SqlType::Text];
        let vals = vec![CellValue::Inline(SqlValue::Text(String::from("x")))];
        assert!(marshal_row(&vals, &types).is_err());
    }

    #[test]
    fn test_null_mask_reflects_nulls() {
        let data = marshal_row(&values(), &schema()).unwrap();
        let mut c = Cursor::new(data.0.as_slice());
        let mask = codec::read_u64(&mut c).unwrap();
        assert_eq!(mask, 0b0100);
    }
}
