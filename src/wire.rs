//! Wire serialization: tagged, length-prefixed, little-endian.
//!
//! One [`Serializer`] buffer is exactly one bus message (one seqpacket
//! datagram). Every element carries a one-byte kind tag so that a schema
//! mismatch between producer and consumer is detected instead of silently
//! misread. A mismatch or cursor overrun is fatal for the connection that
//! produced it.

use thiserror::Error;

/// Kind tag of one wire element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Bool = 1,
    U32 = 2,
    I32 = 3,
    U64 = 4,
    I64 = 5,
    Bytes = 6,
    Str = 7,
    Seq = 8,
}

impl Kind {
    fn from_tag(tag: u8) -> Option<Kind> {
        match tag {
            1 => Some(Kind::Bool),
            2 => Some(Kind::U32),
            3 => Some(Kind::I32),
            4 => Some(Kind::U64),
            5 => Some(Kind::I64),
            6 => Some(Kind::Bytes),
            7 => Some(Kind::Str),
            8 => Some(Kind::Seq),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Kind::Bool => "bool",
            Kind::U32 => "u32",
            Kind::I32 => "i32",
            Kind::U64 => "u64",
            Kind::I64 => "i64",
            Kind::Bytes => "bytes",
            Kind::Str => "str",
            Kind::Seq => "seq",
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("type mismatch at byte {at}: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
        at: usize,
    },
    #[error("unknown wire tag {tag} at byte {at}")]
    UnknownTag { tag: u8, at: usize },
    #[error("message truncated at byte {at}: {need} more bytes required")]
    Truncated { at: usize, need: usize },
    #[error("message too large: max {max} got {got}")]
    MessageTooLarge { max: usize, got: usize },
    #[error("string element is not valid utf-8")]
    InvalidUtf8,
}

/// Accumulates a typed sequence of values into one message buffer.
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    buf: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(Kind::Bool as u8);
        self.buf.push(u8::from(value));
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.push(Kind::U32 as u8);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.push(Kind::I32 as u8);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.push(Kind::U64 as u8);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.push(Kind::I64 as u8);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.push(Kind::Bytes as u8);
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
    }

    pub fn put_str(&mut self, value: &str) {
        self.buf.push(Kind::Str as u8);
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_u32_seq(&mut self, values: &[u32]) {
        self.buf.push(Kind::Seq as u8);
        self.buf.push(Kind::U32 as u8);
        self.buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn put_str_seq<S: AsRef<str>>(&mut self, values: &[S]) {
        self.buf.push(Kind::Seq as u8);
        self.buf.push(Kind::Str as u8);
        self.buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            let value = value.as_ref();
            self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            self.buf.extend_from_slice(value.as_bytes());
        }
    }

    /// Append the elements of `other` after the elements already written.
    pub fn append(&mut self, other: &Serializer) {
        self.buf.extend_from_slice(&other.buf);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads one message back, value by value, in write order.
#[derive(Debug, Clone, Default)]
pub struct Deserializer {
    buf: Vec<u8>,
    cursor: usize,
}

impl Deserializer {
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf, cursor: 0 }
    }

    /// Kind of the next element, if any. Does not advance the cursor.
    pub fn peek_kind(&self) -> Option<Kind> {
        self.buf.get(self.cursor).copied().and_then(Kind::from_tag)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        self.expect_kind(Kind::Bool)?;
        let byte = self.read_exact(1)?;
        Ok(byte[0] != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        self.expect_kind(Kind::U32)?;
        self.read_u32_raw()
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        self.expect_kind(Kind::I32)?;
        let bytes = self.read_exact(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        self.expect_kind(Kind::U64)?;
        let bytes = self.read_exact(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        self.expect_kind(Kind::I64)?;
        let bytes = self.read_exact(8)?;
        Ok(i64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        self.expect_kind(Kind::Bytes)?;
        let len = self.read_u32_raw()? as usize;
        Ok(self.read_exact(len)?.to_vec())
    }

    pub fn get_str(&mut self) -> Result<String, WireError> {
        self.expect_kind(Kind::Str)?;
        let len = self.read_u32_raw()? as usize;
        let bytes = self.read_exact(len)?.to_vec();
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn get_u32_seq(&mut self) -> Result<Vec<u32>, WireError> {
        self.expect_seq(Kind::U32)?;
        let count = self.read_u32_raw()? as usize;
        let mut values = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            values.push(self.read_u32_raw()?);
        }
        Ok(values)
    }

    pub fn get_str_seq(&mut self) -> Result<Vec<String>, WireError> {
        self.expect_seq(Kind::Str)?;
        let count = self.read_u32_raw()? as usize;
        let mut values = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let len = self.read_u32_raw()? as usize;
            let bytes = self.read_exact(len)?.to_vec();
            values.push(String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?);
        }
        Ok(values)
    }

    fn expect_kind(&mut self, expected: Kind) -> Result<(), WireError> {
        let at = self.cursor;
        let tag = self.read_exact(1)?[0];
        let found = Kind::from_tag(tag).ok_or(WireError::UnknownTag { tag, at })?;
        if found != expected {
            return Err(WireError::TypeMismatch {
                expected: expected.name(),
                found: found.name(),
                at,
            });
        }
        Ok(())
    }

    fn expect_seq(&mut self, element: Kind) -> Result<(), WireError> {
        self.expect_kind(Kind::Seq)?;
        let at = self.cursor;
        let tag = self.read_exact(1)?[0];
        let found = Kind::from_tag(tag).ok_or(WireError::UnknownTag { tag, at })?;
        if found != element {
            return Err(WireError::TypeMismatch {
                expected: element.name(),
                found: found.name(),
                at,
            });
        }
        Ok(())
    }

    fn read_u32_raw(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_exact(&mut self, n: usize) -> Result<&[u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                at: self.cursor,
                need: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_values_in_order() {
        let mut ser = Serializer::new();
        ser.put_bool(true);
        ser.put_u32(7);
        ser.put_i32(-3);
        ser.put_u64(u64::MAX);
        ser.put_i64(i64::MIN);
        ser.put_bytes(b"\x00\xff");
        ser.put_str("/svc/foo");
        ser.put_u32_seq(&[1, 2, 3]);
        ser.put_str_seq(&["a", "bc"]);

        let mut des = Deserializer::new(ser.into_bytes());
        assert!(des.get_bool().unwrap());
        assert_eq!(des.get_u32().unwrap(), 7);
        assert_eq!(des.get_i32().unwrap(), -3);
        assert_eq!(des.get_u64().unwrap(), u64::MAX);
        assert_eq!(des.get_i64().unwrap(), i64::MIN);
        assert_eq!(des.get_bytes().unwrap(), b"\x00\xff");
        assert_eq!(des.get_str().unwrap(), "/svc/foo");
        assert_eq!(des.get_u32_seq().unwrap(), vec![1, 2, 3]);
        assert_eq!(des.get_str_seq().unwrap(), vec!["a".to_string(), "bc".to_string()]);
        assert!(des.is_empty());
    }

    #[test]
    fn wrong_position_is_a_type_mismatch() {
        let mut ser = Serializer::new();
        ser.put_u32(1);

        let mut des = Deserializer::new(ser.into_bytes());
        let err = des.get_str().unwrap_err();
        assert!(matches!(
            err,
            WireError::TypeMismatch {
                expected: "str",
                found: "u32",
                at: 0
            }
        ));
    }

    #[test]
    fn reading_past_the_end_is_truncated() {
        let mut ser = Serializer::new();
        ser.put_bool(false);

        let mut des = Deserializer::new(ser.into_bytes());
        assert!(!des.get_bool().unwrap());
        assert!(matches!(des.get_u32().unwrap_err(), WireError::Truncated { .. }));
    }

    #[test]
    fn truncated_string_body_is_detected() {
        let mut ser = Serializer::new();
        ser.put_str("hello");
        let mut bytes = ser.into_bytes();
        bytes.truncate(bytes.len() - 2);

        let mut des = Deserializer::new(bytes);
        assert!(matches!(des.get_str().unwrap_err(), WireError::Truncated { .. }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut des = Deserializer::new(vec![0xee, 0, 0, 0, 0]);
        assert!(matches!(
            des.get_u32().unwrap_err(),
            WireError::UnknownTag { tag: 0xee, at: 0 }
        ));
    }

    #[test]
    fn append_concatenates_element_streams() {
        let mut head = Serializer::new();
        head.put_u32(1);
        let mut tail = Serializer::new();
        tail.put_str("x");
        head.append(&tail);

        let mut des = Deserializer::new(head.into_bytes());
        assert_eq!(des.get_u32().unwrap(), 1);
        assert_eq!(des.get_str().unwrap(), "x");
    }

    #[test]
    fn peek_does_not_advance() {
        let mut ser = Serializer::new();
        ser.put_bool(false);
        let des = Deserializer::new(ser.into_bytes());
        assert_eq!(des.peek_kind(), Some(Kind::Bool));
        assert_eq!(des.peek_kind(), Some(Kind::Bool));
        assert_eq!(des.remaining(), 2);
    }
}
