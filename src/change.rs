//! The unified change record shared by every subsystem.
//!
//! A [`Change`] is a single DML or DDL event tagged with a monotonic
//! [`Position`]. Capture clients and the bootstrap ingester produce them,
//! the buffer stores them, and the apply loop consumes them. DML and DDL
//! are modeled as a sum type so field access is total — there is no
//! "check the kind, then downcast" step anywhere downstream.
//!
//! # Position encoding
//!
//! Positions are canonical sortable strings. Each capture client is
//! responsible for emitting an encoding that compares correctly under
//! plain lexicographic order within its own stream:
//!
//! - PostgreSQL: the 64-bit WAL location as 16 uppercase hex digits
//!   (`00000000016B3748`).
//! - MySQL: zero-padded binlog file suffix and event offset
//!   (`000001:0000001234`), so a log rotation still sorts after every
//!   position in the previous file.
//! - Bootstrap: `bootstrap-NNNNNNNNNN`, a synthetic counter.
//!
//! Bootstrap positions sort strictly before any live position regardless
//! of their textual value; [`Position::sort_key`] encodes that rank for
//! stores that only offer lexicographic ordering.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of synthetic positions produced by the bootstrap ingester.
pub const BOOTSTRAP_PREFIX: &str = "bootstrap-";

/// Opaque, ordered identifier of a point in a source's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    pub fn new(raw: impl Into<String>) -> Self {
        Position(raw.into())
    }

    /// Synthetic bootstrap position for the given 1-based counter.
    pub fn bootstrap(n: u64) -> Self {
        Position(format!("{BOOTSTRAP_PREFIX}{n:010}"))
    }

    /// Canonical encoding of a PostgreSQL WAL location.
    pub fn from_lsn(lsn: u64) -> Self {
        Position(format!("{lsn:016X}"))
    }

    /// Canonical encoding of a MySQL binlog coordinate.
    ///
    /// `file_suffix` is the numeric suffix of the binlog file name
    /// (`binlog.000007` → 7).
    pub fn from_binlog(file_suffix: u64, offset: u64) -> Self {
        Position(format!("{file_suffix:06}:{offset:010}"))
    }

    /// Parse a textual PostgreSQL LSN (`X/Y` hex pair) into the canonical
    /// sortable form.
    pub fn from_lsn_text(text: &str) -> Option<Self> {
        let (hi, lo) = text.split_once('/')?;
        let hi = u64::from_str_radix(hi, 16).ok()?;
        let lo = u64::from_str_radix(lo, 16).ok()?;
        Some(Self::from_lsn((hi << 32) | lo))
    }

    pub fn is_bootstrap(&self) -> bool {
        self.0.starts_with(BOOTSTRAP_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rank-prefixed key for stores that only compare bytes
    /// lexicographically (the redis index). Bootstrap ranks below live.
    pub fn sort_key(&self) -> String {
        if self.is_bootstrap() {
            format!("0{}", self.0)
        } else {
            format!("1{}", self.0)
        }
    }

    /// Inverse of [`Position::sort_key`].
    pub fn from_sort_key(key: &str) -> Option<Self> {
        let (rank, raw) = key.split_at_checked(1)?;
        match rank {
            "0" | "1" => Some(Position(raw.to_string())),
            _ => None,
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_bootstrap(), other.is_bootstrap()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Typed values ───────────────────────────────────────────────────────────

/// Tagged union over the value types a column can carry.
///
/// This is the wire representation as well: serde renders it as
/// `{"t": "int", "v": 42}` so heterogeneous consumers can decode without
/// schema knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    #[serde(with = "bytes_hex")]
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Coarse class name used in mismatch diagnostics.
    pub fn class(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Text(_) => "text",
            SqlValue::Int(_) => "int",
            SqlValue::Float(_) => "float",
            SqlValue::Bool(_) => "bool",
            SqlValue::Timestamp(_) => "timestamp",
            SqlValue::Bytes(_) => "bytes",
        }
    }

    /// Canonical text used for deterministic transform seeding. Two values
    /// that compare equal must produce the same seed text across processes.
    pub fn seed_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => format!("{f:?}"),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            SqlValue::Bytes(b) => hex::encode(b),
        }
    }
}

mod bytes_hex {
    //! Hex-string serde for binary columns; raw bytes are not valid JSON.
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ── Change records ─────────────────────────────────────────────────────────

/// A named column paired with its typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: SqlValue,
}

impl Column {
    pub fn new(name: impl Into<String>, value: SqlValue) -> Self {
        Column { name: name.into(), value }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => f.write_str("insert"),
            Operation::Update => f.write_str("update"),
            Operation::Delete => f.write_str("delete"),
        }
    }
}

/// A row-level change. `old_keys` is populated for updates and deletes
/// and names a unique identifier of the pre-image row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmlChange {
    pub table: String,
    pub op: Operation,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub old_keys: Vec<Column>,
}

/// A schema change, passed through verbatim with its source metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlChange {
    pub statement: String,
    pub username: String,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangePayload {
    Dml(DmlChange),
    Ddl(DdlChange),
}

/// A single DML or DDL event tagged with its stream position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub position: Position,
    #[serde(flatten)]
    pub payload: ChangePayload,
}

impl Change {
    pub fn dml(position: Position, dml: DmlChange) -> Self {
        Change { position, payload: ChangePayload::Dml(dml) }
    }

    pub fn ddl(position: Position, ddl: DdlChange) -> Self {
        Change { position, payload: ChangePayload::Ddl(ddl) }
    }

    pub fn as_dml(&self) -> Option<&DmlChange> {
        match &self.payload {
            ChangePayload::Dml(dml) => Some(dml),
            ChangePayload::Ddl(_) => None,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(&self.payload, ChangePayload::Dml(d) if d.op == Operation::Insert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_sorts_before_live() {
        let boot = Position::bootstrap(9_999_999);
        let live = Position::from_lsn(0x16B3748);
        assert!(boot < live);
        assert!(boot.sort_key() < live.sort_key());
    }

    #[test]
    fn test_lsn_positions_sort_numerically() {
        // "2/0" is numerically above "1/FFFFFFFF" but a naive textual
        // comparison of the X/Y form would order them the other way.
        let low = Position::from_lsn_text("1/FFFFFFFF").unwrap();
        let high = Position::from_lsn_text("2/0").unwrap();
        assert!(low < high);
        assert!(low.sort_key() < high.sort_key());
    }

    #[test]
    fn test_binlog_rotation_sorts_after_previous_file() {
        let before = Position::from_binlog(7, 4_000_000_000);
        let after = Position::from_binlog(8, 4);
        assert!(before < after);
    }

    #[test]
    fn test_sort_key_round_trip() {
        for pos in [
            Position::bootstrap(1),
            Position::from_lsn(0),
            Position::from_binlog(1, 154),
        ] {
            assert_eq!(Position::from_sort_key(&pos.sort_key()), Some(pos));
        }
    }

    #[test]
    fn test_lsn_text_parse() {
        assert_eq!(
            Position::from_lsn_text("0/16B3748").unwrap().as_str(),
            "00000000016B3748"
        );
        assert!(Position::from_lsn_text("junk").is_none());
    }

    #[test]
    fn test_change_json_round_trip() {
        let change = Change::dml(
            Position::from_lsn(100),
            DmlChange {
                table: "public.users".into(),
                op: Operation::Update,
                columns: vec![
                    Column::new("id", SqlValue::Int(1)),
                    Column::new("name", SqlValue::Text("Bob".into())),
                    Column::new("avatar", SqlValue::Bytes(vec![0xDE, 0xAD])),
                ],
                old_keys: vec![Column::new("id", SqlValue::Int(1))],
            },
        );
        let json = serde_json::to_string(&change).unwrap();
        let back: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn test_ddl_json_round_trip() {
        let change = Change::ddl(
            Position::bootstrap(1),
            DdlChange {
                statement: "CREATE TABLE t (id int)".into(),
                username: "postgres".into(),
                database: "app".into(),
            },
        );
        let json = serde_json::to_string(&change).unwrap();
        assert_eq!(serde_json::from_str::<Change>(&json).unwrap(), change);
    }

    #[test]
    fn test_seed_text_distinguishes_null_from_empty() {
        // NULL is never transformed, so its collision with the empty
        // string is unreachable in practice.
        assert_eq!(SqlValue::Null.seed_text(), "");
        assert_eq!(SqlValue::Text(String::new()).seed_text(), "");
        assert_ne!(
            SqlValue::Int(10).seed_text(),
            SqlValue::Float(10.0).seed_text()
        );
    }
}
