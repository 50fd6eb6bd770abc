//! Query-related data models.
//!
//! This module defines parameter values, execution limits, decoded rows and
//! the result set returned by the executor.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Default row limit for query results.
pub const DEFAULT_ROW_LIMIT: u32 = 100;

/// Maximum allowed row limit.
pub const MAX_ROW_LIMIT: u32 = 10000;

/// Default query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Maximum query timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u64 = 300;

/// Default cap on the serialized size of returned rows.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Hard cap on the serialized size of returned rows.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// A positional parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Arrays and objects, bound as JSON
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

/// Caller-supplied execution limits. Missing fields fall back to server defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryLimits {
    /// Maximum rows to return. Default: 100, max: 10000
    #[serde(default)]
    pub max_rows: Option<u32>,
    /// Server-side execution time limit in milliseconds. Default: 30000, max: 300000
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    /// Maximum serialized size of the returned rows. Default: 4 MiB, max: 64 MiB
    #[serde(default)]
    pub max_payload_bytes: Option<usize>,
}

impl QueryLimits {
    /// Fill in defaults and clamp every limit into its allowed range.
    ///
    /// `max_rows = 0` is clamped to 1 so that a result is never reported as
    /// truncated without returning anything.
    pub fn resolve(&self, defaults: &ResolvedLimits) -> ResolvedLimits {
        ResolvedLimits {
            max_rows: self
                .max_rows
                .unwrap_or(defaults.max_rows)
                .clamp(1, MAX_ROW_LIMIT),
            max_execution_time: self
                .max_execution_time_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_execution_time)
                .clamp(
                    Duration::from_millis(1),
                    Duration::from_secs(MAX_QUERY_TIMEOUT_SECS),
                ),
            max_payload_bytes: self
                .max_payload_bytes
                .unwrap_or(defaults.max_payload_bytes)
                .clamp(1, MAX_PAYLOAD_BYTES),
        }
    }
}

/// Limits actually enforced by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub max_rows: u32,
    pub max_execution_time: Duration,
    pub max_payload_bytes: usize,
}

impl Default for ResolvedLimits {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_ROW_LIMIT,
            max_execution_time: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create new column metadata.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

/// One decoded row. Column metadata is shared between rows of the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct DbRow {
    pub columns: Arc<[ColumnMetadata]>,
    pub values: Vec<JsonValue>,
}

impl DbRow {
    pub fn new(columns: Arc<[ColumnMetadata]>, values: Vec<JsonValue>) -> Self {
        Self { columns, values }
    }

    /// Look up a value by column name (first match, case-sensitive).
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Case-insensitive lookup, for metadata queries whose column casing varies by engine.
    pub fn get_ci(&self, name: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.get_ci(name)? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get_ci(name)? {
            JsonValue::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            JsonValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get_ci(name)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
            JsonValue::String(s) => match s.to_ascii_lowercase().as_str() {
                "1" | "t" | "true" | "yes" => Some(true),
                "0" | "f" | "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Convert into a column-name keyed JSON object.
    pub fn into_map(self) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .map(|c| c.name.clone())
            .zip(self.values)
            .collect()
    }
}

/// Why a result set stopped before the statement's natural end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum TruncationReason {
    RowLimit,
    PayloadLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation_reason: Option<TruncationReason>,
    pub execution_time_ms: u64,
}

impl ResultSet {
    /// Result of a statement that returns no rows (DML/DDL).
    pub fn affected(rows_affected: u64, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            rows_affected: Some(rows_affected),
            truncated: false,
            truncation_reason: None,
            execution_time_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rows_affected.is_none()
    }
}
