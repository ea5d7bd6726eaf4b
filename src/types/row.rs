//! # Row Sequences
//!
//! A [`Row`] is an ordered sequence of [`Value`]s. The encoding is a u32
//! count followed by the concatenated value encodings, sharing the cursor
//! discipline of the value codec. The B+Tree itself stores value pairs,
//! not rows; rows exist for callers that pack multiple columns into one
//! data-page record.

use crate::error::{Error, Result};
use crate::types::Value;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.values.iter().map(Value::serialized_size).sum::<usize>()
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend((self.values.len() as u32).to_le_bytes());
        for value in &self.values {
            value.serialize(buf);
        }
    }

    pub fn deserialize(buf: &[u8], cursor: &mut usize) -> Result<Row> {
        let end = cursor
            .checked_add(4)
            .filter(|&e| e <= buf.len())
            .ok_or_else(|| Error::corruption("truncated input reading row count"))?;
        let count =
            u32::from_le_bytes(buf[*cursor..end].try_into().expect("4-byte slice")) as usize;
        *cursor = end;

        let mut values = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            values.push(Value::deserialize(buf, cursor)?);
        }
        Ok(Row { values })
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row { values }
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_roundtrip() {
        let row = Row::from_values(vec![
            Value::Int64(42),
            Value::Text("widget".to_string()),
            Value::Null,
            Value::Float64(2.5),
        ]);

        let mut buf = Vec::new();
        row.serialize(&mut buf);
        assert_eq!(buf.len(), row.serialized_size());

        let mut cursor = 0;
        let decoded = Row::deserialize(&buf, &mut cursor).unwrap();
        assert_eq!(cursor, buf.len());
        assert_eq!(decoded, row);
    }

    #[test]
    fn empty_row_roundtrip() {
        let row = Row::new();
        let mut buf = Vec::new();
        row.serialize(&mut buf);
        assert_eq!(buf.len(), 4);

        let mut cursor = 0;
        let decoded = Row::deserialize(&buf, &mut cursor).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn rows_concatenate_with_shared_cursor() {
        let a = Row::from_values(vec![Value::Int32(1)]);
        let b = Row::from_values(vec![Value::Bool(true), Value::Blob(vec![9])]);

        let mut buf = Vec::new();
        a.serialize(&mut buf);
        b.serialize(&mut buf);

        let mut cursor = 0;
        assert_eq!(Row::deserialize(&buf, &mut cursor).unwrap(), a);
        assert_eq!(Row::deserialize(&buf, &mut cursor).unwrap(), b);
        assert_eq!(cursor, buf.len());
    }

    #[test]
    fn truncated_row_is_corruption() {
        let row = Row::from_values(vec![Value::Int64(7), Value::Int64(8)]);
        let mut buf = Vec::new();
        row.serialize(&mut buf);
        buf.truncate(buf.len() - 3);

        let mut cursor = 0;
        assert!(Row::deserialize(&buf, &mut cursor).is_err());
    }

    #[test]
    fn index_access() {
        let row = Row::from_values(vec![Value::Int8(1), Value::Int8(2)]);
        assert_eq!(row[1], Value::Int8(2));
        assert_eq!(row.get(5), None);
    }
}
