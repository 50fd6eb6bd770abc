//! Data models for the DB tool server.
//!
//! This module re-exports all model types used throughout the application.

pub mod datasource;
pub mod query;
pub mod schema;

pub use datasource::{
    AccessPolicy, DatasourceConfig, DatasourceConfigError, DatasourceInfo, EngineKind,
    PoolSettings, mask_connection_string,
};
pub use query::{
    ColumnMetadata, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_ROW_LIMIT,
    DbRow, MAX_PAYLOAD_BYTES, MAX_QUERY_TIMEOUT_SECS, MAX_ROW_LIMIT, QueryLimits, QueryParam,
    ResolvedLimits, ResultSet, TruncationReason,
};
pub use schema::{
    ColumnDefinition, ForeignKey, ForeignKeyAction, IndexInfo, TableInfo, TableSchema, TableType,
    format_size,
};
