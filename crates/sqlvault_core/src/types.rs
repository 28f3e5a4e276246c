//! Common types for sqlvault core.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use rusqlite::types::Value;

/// Lock acquisition strategy for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    /// No lock until the first write.
    #[default]
    Deferred,
    /// Write-intent lock taken at BEGIN.
    Immediate,
    /// Blocks all other readers and writers.
    Exclusive,
}

impl TransactionMode {
    /// Returns the SQL that opens a transaction in this mode.
    #[must_use]
    pub const fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }

    /// Returns the lowercase mode name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Immediate => "immediate",
            Self::Exclusive => "exclusive",
        }
    }

    /// Picks a mode from free text such as `begin immediate transaction`.
    ///
    /// Returns `None` when neither `IMMEDIATE` nor `EXCLUSIVE` appears, so the
    /// caller can fall back to its configured default.
    #[must_use]
    pub fn from_instruction(text: &str) -> Option<Self> {
        let upper = text.to_ascii_uppercase();
        if upper.contains("EXCLUSIVE") {
            Some(Self::Exclusive)
        } else if upper.contains("IMMEDIATE") {
            Some(Self::Immediate)
        } else if upper.contains("DEFERRED") {
            Some(Self::Deferred)
        } else {
            None
        }
    }
}

impl FromStr for TransactionMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deferred" => Ok(Self::Deferred),
            "immediate" => Ok(Self::Immediate),
            "exclusive" => Ok(Self::Exclusive),
            _ => Err(CoreError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum TransactionStatus {
    /// No transaction open; statements autocommit.
    #[default]
    Idle,
    /// A transaction is open.
    Active,
    /// COMMIT failed; only ROLLBACK is accepted.
    Failed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// PostgreSQL type reported for a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PgType {
    /// `int8`
    Int8,
    /// `text`
    Text,
    /// `bytea`
    Bytea,
    /// `float8`
    Float8,
    /// `numeric`
    Numeric,
    /// `date`
    Date,
    /// `timestamp`
    Timestamp,
    /// `bool`
    Bool,
}

impl PgType {
    /// Maps a declared SQLite column type by affinity substring.
    ///
    /// `DATE` is tested before `TIME`, so `DATETIME` maps to `date`.
    #[must_use]
    pub fn from_decl(decl: Option<&str>) -> Self {
        let Some(decl) = decl else {
            return Self::Text;
        };
        let decl = decl.trim().to_ascii_uppercase();
        let has = |needle: &str| decl.contains(needle);

        if has("INT") {
            Self::Int8
        } else if has("CHAR") || has("CLOB") || has("TEXT") {
            Self::Text
        } else if has("BLOB") {
            Self::Bytea
        } else if has("REAL") || has("FLOA") || has("DOUB") {
            Self::Float8
        } else if has("NUMERIC") || has("DECIMAL") {
            Self::Numeric
        } else if has("DATE") {
            Self::Date
        } else if has("TIME") {
            Self::Timestamp
        } else if has("BOOL") {
            Self::Bool
        } else {
            Self::Text
        }
    }

    /// Returns the PostgreSQL type name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Text => "text",
            Self::Bytea => "bytea",
            Self::Float8 => "float8",
            Self::Numeric => "numeric",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for PgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name as reported by the engine.
    pub name: String,
    /// Declared SQLite type, if the column maps to a table column.
    pub decl_type: Option<String>,
    /// Mapped PostgreSQL type.
    pub pg_type: PgType,
}

impl Column {
    /// Creates a column description, deriving the PostgreSQL type.
    pub fn new(name: impl Into<String>, decl_type: Option<&str>) -> Self {
        Self {
            name: name.into(),
            decl_type: decl_type.map(str::to_string),
            pg_type: PgType::from_decl(decl_type),
        }
    }
}

/// Materialized rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column descriptions, in select order.
    pub columns: Vec<Column>,
    /// Row values; each row has one value per column.
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the query produced no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
