//! Fixed-width binary marshal/unmarshal primitives.
//!
//! Everything stored in a page goes through these: little-endian scalars,
//! IEEE 754 bit-cast floats, one-byte booleans, and strings as a 4-byte
//! unsigned length followed by UTF-8 bytes (no terminator).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};

pub fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(u8::from(v));
}

pub fn read_bool(c: &mut Cursor<&[u8]>) -> Result<bool> {
    match c.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::corrupt(format!("bad bool byte 0x{:02x}", other))),
    }
}

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn read_u8(c: &mut Cursor<&[u8]>) -> Result<u8> {
    Ok(c.read_u8()?)
}

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.write_u16::<LittleEndian>(v).expect("vec write");
}

pub fn read_u16(c: &mut Cursor<&[u8]>) -> Result<u16> {
    Ok(c.read_u16::<LittleEndian>()?)
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.write_u32::<LittleEndian>(v).expect("vec write");
}

pub fn read_u32(c: &mut Cursor<&[u8]>) -> Result<u32> {
    Ok(c.read_u32::<LittleEndian>()?)
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.write_u64::<LittleEndian>(v).expect("vec write");
}

pub fn read_u64(c: &mut Cursor<&[u8]>) -> Result<u64> {
    Ok(c.read_u64::<LittleEndian>()?)
}

pub fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.write_i32::<LittleEndian>(v).expect("vec write");
}

pub fn read_i32(c: &mut Cursor<&[u8]>) -> Result<i32> {
    Ok(c.read_i32::<LittleEndian>()?)
}

pub fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.write_i64::<LittleEndian>(v).expect("vec write");
}

pub fn read_i64(c: &mut Cursor<&[u8]>) -> Result<i64> {
    Ok(c.read_i64::<LittleEndian>()?)
}

pub fn write_f32(buf: &mut Vec<u8>, v: f32) {
    buf.write_f32::<LittleEndian>(v).expect("vec write");
}

pub fn read_f32(c: &mut Cursor<&[u8]>) -> Result<f32> {
    Ok(c.read_f32::<LittleEndian>()?)
}

pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    buf.write_f64::<LittleEndian>(v).expect("vec write");
}

pub fn read_f64(c: &mut Cursor<&[u8]>) -> Result<f64> {
    Ok(c.read_f64::<LittleEndian>()?)
}

/// 4-byte unsigned length, then the UTF-8 bytes.
pub fn write_str(buf: &mut Vec<u8>, v: &str) {
    write_u32(buf, v.len() as u32);
    buf.extend_from_slice(v.as_bytes());
}

pub fn read_str(c: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u32(c)? as usize;
    let bytes = read_exact(c, len)?;
    String::from_utf8(bytes).map_err(|e| Error::corrupt(format!("invalid utf-8 string: {}", e)))
}

/// byte size `write_str` will take for `v`.
pub fn str_size(v: &str) -> usize {
    4 + v.len()
}

pub fn read_exact(c: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let pos = c.position() as usize;
    let data = *c.get_ref();
    if pos + len > data.len() {
        return Err(Error::corrupt(format!(
            "short read: wanted {} bytes at offset {}, have {}",
            len,
            pos,
            data.len()
        )));
    }
    c.set_position((pos + len) as u64);
    Ok(data[pos..pos + len].to_vec())
}

/// Skip `len` bytes without copying them out.
pub fn skip(c: &mut Cursor<&[u8]>, len: usize) -> Result<()> {
    let pos = c.position() as usize;
    if pos + len > c.get_ref().len() {
        return Err(Error::corrupt(format!(
            "short skip: wanted {} bytes at offset {}",
            len, pos
        )));
    }
    c.set_position((pos + len) as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trips() {
        let mut buf = vec![];
        write_bool(&mut buf, true);
        write_bool(&mut buf, false);
        write_i32(&mut buf, -12345);
        write_i64(&mut buf, i64::MIN);
        write_f32(&mut buf, 3.5_f32);
        write_f64(&mut buf, -0.125_f64);
        write_u32(&mut buf, 0xdead_beef);
        write_u64(&mut buf, u64::MAX);

        let mut c = Cursor::new(buf.as_slice());
        assert!(read_bool(&mut c).unwrap());
        assert!(!read_bool(&mut c).unwrap());
        assert_eq!(read_i32(&mut c).unwrap(), -12345);
        assert_eq!(read_i64(&mut c).unwrap(), i64::MIN);
        assert_eq!(read_f32(&mut c).unwrap(), 3.5_f32);
        assert_eq!(read_f64(&mut c).unwrap(), -0.125_f64);
        assert_eq!(read_u32(&mut c).unwrap(), 0xdead_beef);
        assert_eq!(read_u64(&mut c).unwrap(), u64::MAX);
    }

    #[test]
    fn test_string_round_trip() {
        let cases = ["", "a", "hello world", "日本語テキスト"];
        for case in cases {
            let mut buf = vec![];
            write_str(&mut buf, case);
            assert_eq!(buf.len(), str_size(case));
            let mut c = Cursor::new(buf.as_slice());
            assert_eq!(read_str(&mut c).unwrap(), case);
        }
    }

    #[test]
    fn test_bad_bool_is_corrupt() {
        let buf = [7_u8];
        let mut c = Cursor::new(&buf[..]);
        assert!(matches!(
            read_bool(&mut c),
            Err(Error::CorruptPage { .. })
        ));
    }

    #[test]
    fn test_truncated_string_is_corrupt() {
        let mut buf = vec![];
        write_str(&mut buf, "hello");
        buf.truncate(6);
        let mut c = Cursor::new(buf.as_slice());
        assert!(matches!(read_str(&mut c), Err(Error::CorruptPage { .. })));
    }
}
