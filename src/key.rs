//! B+-tree key kinds.
//!
//! Single-column keys are the native kinds.  Composite keys are a tuple of
//! column values with two materialised byte views:
//!
//! * the *comparison view* -- order-preserving fixed-width encodings (and
//!   raw string bytes) concatenated; composite ordering is plain
//!   byte-lexicographic comparison of this view, so a k-column prefix is
//!   just a truncation of it;
//! * the *storage view* -- the codec form written into index pages, with a
//!   one-byte kind tag per field and length-prefixed strings so cells can
//!   be decoded without schema context.
//!
//! The tree itself never inspects key structure; it only needs the
//! [`Ord`] impl and the encode/decode/byte-size contract.

use enum_as_inner::EnumAsInner;
use std::cmp::Ordering;
use std::io::Cursor;

use crate::codec;
use crate::error::{Error, Result};
use crate::sql_value::SqlValue;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT4: u8 = 2;
const TAG_INT8: u8 = 3;
const TAG_FLOAT4: u8 = 4;
const TAG_FLOAT8: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_COMPOSITE: u8 = 7;

#[derive(Debug, Clone, EnumAsInner)]
pub enum Key {
    /// Non-unique indexes treat SQL NULL as a distinct key.
    Null,
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Str(String),
    Composite(CompositeKey),
}

impl Key {
    /// Build a key field from a column value.  Timestamps map onto their
    /// microsecond count; TEXT onto its bytes.
    pub fn from_value(v: &SqlValue) -> Key {
        match v {
            SqlValue::Null => Key::Null,
            SqlValue::Bool(b) => Key::Bool(*b),
            SqlValue::Int4(i) => Key::Int4(*i),
            SqlValue::Int8(i) => Key::Int8(*i),
            SqlValue::Float4(x) => Key::Float4(*x),
            SqlValue::Float8(x) => Key::Float8(*x),
            SqlValue::Text(s) => Key::Str(s.clone()),
            SqlValue::Time(us) => Key::Int8(*us),
        }
    }

    /// The value this key field stands for, for row reconstruction and
    /// error messages.  The inverse of [`Key::from_value`] up to the
    /// TEXT/TIMESTAMP representation collapse.
    pub fn to_value(&self) -> SqlValue {
        match self {
            Key::Null => SqlValue::Null,
            Key::Bool(b) => SqlValue::Bool(*b),
            Key::Int4(i) => SqlValue::Int4(*i),
            Key::Int8(i) => SqlValue::Int8(*i),
            Key::Float4(x) => SqlValue::Float4(*x),
            Key::Float8(x) => SqlValue::Float8(*x),
            Key::Str(s) => SqlValue::Text(s.clone()),
            Key::Composite(_) => SqlValue::Null,
        }
    }

    /// Storage-view size in bytes, tag included.
    pub fn byte_size(&self) -> usize {
        1 + match self {
            Key::Null => 0,
            Key::Bool(_) => 1,
            Key::Int4(_) | Key::Float4(_) => 4,
            Key::Int8(_) | Key::Float8(_) => 8,
            Key::Str(s) => codec::str_size(s),
            Key::Composite(ck) => {
                1 + ck.fields.iter().map(Key::byte_size).sum::<usize>()
            }
        }
    }

    /// Append the storage view.
    pub fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Key::Null => codec::write_u8(buf, TAG_NULL),
            Key::Bool(b) => {
                codec::write_u8(buf, TAG_BOOL);
                codec::write_bool(buf, *b);
            }
            Key::Int4(i) => {
                codec::write_u8(buf, TAG_INT4);
                codec::write_i32(buf, *i);
            }
            Key::Int8(i) => {
                codec::write_u8(buf, TAG_INT8);
                codec::write_i64(buf, *i);
            }
            Key::Float4(x) => {
                codec::write_u8(buf, TAG_FLOAT4);
                codec::write_f32(buf, *x);
            }
            Key::Float8(x) => {
                codec::write_u8(buf, TAG_FLOAT8);
                codec::write_f64(buf, *x);
            }
            Key::Str(s) => {
                codec::write_u8(buf, TAG_STR);
                codec::write_str(buf, s);
            }
            Key::Composite(ck) => {
                codec::write_u8(buf, TAG_COMPOSITE);
                codec::write_u8(buf, ck.fields.len() as u8);
                for f in &ck.fields {
                    f.write(buf);
                }
            }
        }
    }

    /// Decode a storage-view key.
    pub fn read(c: &mut Cursor<&[u8]>) -> Result<Key> {
        let tag = codec::read_u8(c)?;
        Ok(match tag {
            TAG_NULL => Key::Null,
            TAG_BOOL => Key::Bool(codec::read_bool(c)?),
            TAG_INT4 => Key::Int4(codec::read_i32(c)?),
            TAG_INT8 => Key::Int8(codec::read_i64(c)?),
            TAG_FLOAT4 => Key::Float4(codec::read_f32(c)?),
            TAG_FLOAT8 => Key::Float8(codec::read_f64(c)?),
            TAG_STR => Key::Str(codec::read_str(c)?),
            TAG_COMPOSITE => {
                let n = codec::read_u8(c)? as usize;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    let f = Key::read(c)?;
                    if matches!(f, Key::Composite(_)) {
                        return Err(Error::corrupt("nested composite key"));
                    }
                    fields.push(f);
                }
                Key::Composite(CompositeKey::new(fields))
            }
            other => {
                return Err(Error::corrupt(format!(
                    "bad key tag 0x{}",
                    hex::encode([other])
                )))
            }
        })
    }

    /// Append this field's slice of the comparison view.
    fn write_cmp_view(&self, buf: &mut Vec<u8>) {
        match self {
            Key::Null => buf.push(0x00),
            Key::Bool(b) => buf.push(u8::from(*b)),
            Key::Int4(i) => buf.extend_from_slice(&((*i as u32) ^ (1 << 31)).to_be_bytes()),
            Key::Int8(i) => buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes()),
            Key::Float4(x) => buf.extend_from_slice(&f32_order_bits(*x).to_be_bytes()),
            Key::Float8(x) => buf.extend_from_slice(&f64_order_bits(*x).to_be_bytes()),
            Key::Str(s) => buf.extend_from_slice(s.as_bytes()),
            Key::Composite(ck) => buf.extend_from_slice(&ck.cmp_view),
        }
    }
}

/// Map float bits so that unsigned big-endian comparison matches
/// `total_cmp` order: flip everything for negatives, flip the sign bit for
/// positives.
fn f32_order_bits(x: f32) -> u32 {
    let bits = x.to_bits();
    if bits & (1 << 31) != 0 {
        !bits
    } else {
        bits | (1 << 31)
    }
}

fn f64_order_bits(x: f64) -> u64 {
    let bits = x.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn rank(k: &Key) -> u8 {
    match k {
        Key::Null => 0,
        Key::Bool(_) => 1,
        Key::Int4(_) => 2,
        Key::Int8(_) => 3,
        Key::Float4(_) => 4,
        Key::Float8(_) => 5,
        Key::Str(_) => 6,
        Key::Composite(_) => 7,
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        use Key::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int4(a), Int4(b)) => a.cmp(b),
            (Int8(a), Int8(b)) => a.cmp(b),
            (Float4(a), Float4(b)) => a.total_cmp(b),
            (Float8(a), Float8(b)) => a.total_cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Composite(a), Composite(b)) => a.cmp_view.cmp(&b.cmp_view),
            // A well-formed tree holds one key kind; anything else sorts by
            // a fixed rank so cmp stays total.
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

/// A tuple of scalar key fields with its comparison view materialised.
#[derive(Debug, Clone)]
pub struct CompositeKey {
    fields: Vec<Key>,
    cmp_view: Vec<u8>,
}

impl CompositeKey {
    pub fn new(fields: Vec<Key>) -> CompositeKey {
        let mut cmp_view = vec![];
        for f in &fields {
            f.write_cmp_view(&mut cmp_view);
        }
        CompositeKey { fields, cmp_view }
    }

    pub fn fields(&self) -> &[Key] {
        &self.fields
    }

    pub fn comparison_view(&self) -> &[u8] {
        &self.cmp_view
    }

    /// The key formed by the first `k` fields.
    pub fn prefix(&self, k: usize) -> CompositeKey {
        CompositeKey::new(self.fields[..k.min(self.fields.len())].to_vec())
    }

    /// Exclusive upper bound for the half-open prefix range `[self, self++)`:
    /// the comparison view with a sentinel high byte appended.  Never stored,
    /// only compared against.
    pub fn upper_sentinel(&self) -> CompositeKey {
        let mut cmp_view = self.cmp_view.clone();
        cmp_view.push(0xff);
        CompositeKey {
            fields: self.fields.clone(),
            cmp_view,
        }
    }
}

/// One end of a range scan.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub key: Key,
    pub inclusive: bool,
}

/// `{lower?, upper?}` for `scan_range`; `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeCondition {
    pub lower: Option<RangeBound>,
    pub upper: Option<RangeBound>,
}

impl RangeCondition {
    /// The half-open range covering every composite key starting with `prefix`.
    pub fn for_prefix(prefix: CompositeKey) -> RangeCondition {
        let upper = Key::Composite(prefix.upper_sentinel());
        RangeCondition {
            lower: Some(RangeBound {
                key: Key::Composite(prefix),
                inclusive: true,
            }),
            upper: Some(RangeBound {
                key: upper,
                inclusive: false,
            }),
        }
    }

    pub fn below_lower(&self, k: &Key) -> bool {
        match &self.lower {
            None => false,
            Some(b) => match k.cmp(&b.key) {
                Ordering::Less => true,
                Ordering::Equal => !b.inclusive,
                Ordering::Greater => false,
            },
        }
    }

    pub fn above_upper(&self, k: &Key) -> bool {
        match &self.upper {
            None => false,
            Some(b) => match k.cmp(&b.key) {
                Ordering::Greater => true,
                Ordering::Equal => !b.inclusive,
                Ordering::Less => false,
            },
        }
    }

    pub fn contains(&self, k: &Key) -> bool {
        !self.below_lower(k) && !self.above_upper(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(k: &Key) -> Key {
        let mut buf = vec![];
        k.write(&mut buf);
        assert_eq!(buf.len(), k.byte_size());
        let mut c = Cursor::new(buf.as_slice());
        Key::read(&mut c).unwrap()
    }

    #[test]
    fn test_key_round_trips() {
        let cases = vec![
            Key::Null,
            Key::Bool(true),
            Key::Int4(-7),
            Key::Int8(i64::MAX),
            Key::Float4(1.5),
            Key::Float8(-2.25),
            Key::Str(String::from("hello")),
            Key::Composite(CompositeKey::new(vec![
                Key::Str(String::from("NL")),
                Key::Int4(10),
            ])),
        ];
        for k in cases {
            assert_eq!(round_trip(&k), k);
        }
    }

    #[test]
    fn test_scalar_ordering() {
        assert!(Key::Int4(-5) < Key::Int4(3));
        assert!(Key::Null < Key::Int4(i32::MIN));
        assert!(Key::Float8(-1.0) < Key::Float8(0.0));
        assert!(Key::Str(String::from("a")) < Key::Str(String::from("ab")));
    }

    #[test]
    fn test_composite_order_matches_comparison_view() {
        let mk = |country: &str, pop: i32| {
            CompositeKey::new(vec![Key::Str(country.to_string()), Key::Int4(pop)])
        };
        let cases = [
            (mk("DE", 1), mk("DE", 2)),
            (mk("DE", -3), mk("DE", 2)),
            (mk("DE", 100), mk("NL", 1)),
        ];
        for (a, b) in &cases {
            assert_eq!(
                Key::Composite(a.clone()).cmp(&Key::Composite(b.clone())),
                Ordering::Less
            );
            assert_eq!(
                a.comparison_view().cmp(b.comparison_view()),
                Ordering::Less
            );
        }
    }

    #[test]
    fn test_prefix_range_contains_only_prefixed_keys() {
        let full = |c: &str, city: &str| {
            Key::Composite(CompositeKey::new(vec![
                Key::Str(c.to_string()),
                Key::Str(city.to_string()),
            ]))
        };
        let range =
            RangeCondition::for_prefix(CompositeKey::new(vec![Key::Str(String::from("NL"))]));
        assert!(range.contains(&full("NL", "Amsterdam")));
        assert!(range.contains(&full("NL", "Utrecht")));
        assert!(!range.contains(&full("DE", "Berlin")));
        assert!(!range.contains(&full("US", "Boston")));
    }

    #[test]
    fn test_float_order_bits_are_monotonic() {
        let xs = [-f64::INFINITY, -2.0, -0.5, 0.0, 0.25, 3.0, f64::INFINITY];
        for w in xs.windows(2) {
            assert!(f64_order_bits(w[0]) < f64_order_bits(w[1]));
        }
    }
}
