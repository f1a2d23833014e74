//! Warehouse-agnostic value and row types.
//!
//! The pipeline never interprets warehouse-native wire formats; connectors
//! decode rows into this small logical value model before handing them to the
//! extractor, and encode them back on load. The canonical byte form defined
//! here is what checksums and hash aggregates are computed over, so it must
//! be stable across releases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single column value in its logical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// 64-bit signed integer.
    Int(i64),

    /// 64-bit floating point.
    Float(f64),

    /// Text data.
    Text(String),

    /// UTC timestamp (partition columns are always this variant).
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Append the canonical byte encoding of this value to `buf`.
    ///
    /// Each value is a one-byte type tag followed by a fixed-width or
    /// length-prefixed payload, so distinct values never alias (e.g.
    /// `Int(1)` vs `Text("1")`).
    pub fn write_canonical(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(0),
            Value::Bool(b) => {
                buf.push(1);
                buf.push(u8::from(*b));
            }
            Value::Int(v) => {
                buf.push(2);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                buf.push(3);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                buf.push(4);
                buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Timestamp(ts) => {
                buf.push(5);
                buf.extend_from_slice(&ts.timestamp_micros().to_le_bytes());
            }
        }
    }

    /// Canonical bytes as an owned buffer.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_canonical(&mut buf);
        buf
    }
}

/// One row of a table, positional per the declared column list.
pub type Row = Vec<Value>;

/// Append the canonical encoding of a whole row to `buf`.
pub fn write_row_canonical(row: &Row, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(row.len() as u64).to_le_bytes());
    for value in row {
        value.write_canonical(buf);
    }
}
