//! Schema introspection.
//!
//! Metadata is read with fixed, server-built queries against each engine's
//! catalog. Table names supplied by callers are only ever bound as parameters
//! or quoted as identifiers; they are never spliced into SQL text.
//!
//! Everything here runs on a connection the caller already leased, through the
//! [`DriverConnection`] seam.

use crate::db::driver::DriverConnection;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefinition, DbRow, EngineKind, ForeignKey, ForeignKeyAction, IndexInfo, QueryParam,
    TableInfo, TableSchema, TableType,
};
use crate::sql::SqlDialect;
use futures_util::TryStreamExt;
use tracing::debug;

/// Schema inspector for database introspection.
pub struct SchemaInspector;

impl SchemaInspector {
    /// List the tables (and optionally views) of one schema.
    ///
    /// `schema` defaults to `public` on PostgreSQL and to the connection's
    /// current database on MySQL. SQLite ignores it.
    pub async fn list_tables<T: DriverConnection>(
        conn: &mut T,
        engine: EngineKind,
        schema: Option<&str>,
        include_views: bool,
    ) -> DbResult<Vec<TableInfo>> {
        let tables = match engine {
            EngineKind::Postgres => postgres::list_tables(conn, schema, include_views).await?,
            EngineKind::MySql => mysql::list_tables(conn, schema, include_views).await?,
            EngineKind::Sqlite => sqlite::list_tables(conn, include_views).await?,
        };
        debug!(engine = %engine, count = tables.len(), "Listed tables");
        Ok(tables)
    }

    /// Describe one table: columns, keys, indexes and an exact row count.
    ///
    /// The output is normalized so that an unchanged table always describes
    /// identically.
    pub async fn describe_table<T: DriverConnection>(
        conn: &mut T,
        engine: EngineKind,
        table_name: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        let mut described = match engine {
            EngineKind::Postgres => postgres::describe_table(conn, table_name, schema).await?,
            EngineKind::MySql => mysql::describe_table(conn, table_name, schema).await?,
            EngineKind::Sqlite => sqlite::describe_table(conn, table_name).await?,
        };

        let dialect = SqlDialect::new(engine);
        let count_sql = format!(
            "SELECT COUNT(*) AS row_count FROM {}",
            dialect.quote_qualified(described.schema_name.as_deref(), table_name)
        );
        described.row_count = fetch_all(conn, &count_sql, &[])
            .await?
            .first()
            .and_then(|row| row.get_u64("row_count"));

        Ok(described.normalize())
    }
}

/// Run a metadata query and collect every row.
async fn fetch_all<T: DriverConnection>(
    conn: &mut T,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<Vec<DbRow>> {
    conn.fetch(sql, params).try_collect().await
}

/// Secondary metadata (sizes, indexes) is best-effort: a missing catalog view
/// degrades the output, a dead connection still fails the call.
async fn fetch_optional<T: DriverConnection>(
    conn: &mut T,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<Vec<DbRow>> {
    match fetch_all(conn, sql, params).await {
        Ok(rows) => Ok(rows),
        Err(e) if e.is_connection_fatal() => Err(e),
        Err(e) => {
            debug!(error = %e, "Optional metadata query failed");
            Ok(Vec::new())
        }
    }
}

fn table_not_found(table_name: &str) -> DbError {
    DbError::query_failed(
        format!("Table '{}' not found", table_name),
        None,
        "Call listTables to see available tables",
    )
}

fn param(value: Option<&str>) -> QueryParam {
    value
        .map(|v| QueryParam::String(v.to_string()))
        .unwrap_or(QueryParam::Null)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub mod postgres {
        pub const LIST_TABLES: &str = r#"
            SELECT
                t.table_name,
                t.table_type,
                CASE
                    WHEN t.table_type = 'BASE TABLE'
                    THEN pg_total_relation_size((quote_ident($1) || '.' || quote_ident(t.table_name))::regclass)
                    ELSE NULL
                END AS total_size,
                s.n_live_tup AS estimated_rows,
                obj_description((quote_ident($1) || '.' || quote_ident(t.table_name))::regclass) AS comment
            FROM information_schema.tables t
            LEFT JOIN pg_stat_user_tables s
                ON s.schemaname = t.table_schema AND s.relname = t.table_name
            WHERE t.table_schema = $1
            AND (t.table_type = 'BASE TABLE' OR ($2 AND t.table_type = 'VIEW'))
            ORDER BY t.table_name
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT
                c.column_name,
                format_type(a.atttypid, a.atttypmod) AS column_type,
                c.is_nullable,
                c.column_default,
                CASE WHEN pk.column_name IS NOT NULL THEN true ELSE false END AS is_primary_key,
                col_description(t.oid, a.attnum) AS column_comment
            FROM information_schema.columns c
            JOIN pg_class t ON t.relname = c.table_name
            JOIN pg_namespace n ON n.oid = t.relnamespace AND n.nspname = c.table_schema
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attname = c.column_name
            LEFT JOIN (
                SELECT kcu.column_name
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                WHERE tc.table_name = $1
                AND tc.table_schema = $2
                AND tc.constraint_type = 'PRIMARY KEY'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_name = $1 AND c.table_schema = $2
            ORDER BY c.ordinal_position
            "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
            SELECT
                kcu.column_name,
                ccu.table_name AS foreign_table_name,
                ccu.column_name AS foreign_column_name,
                rc.delete_rule,
                rc.update_rule
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON ccu.constraint_name = tc.constraint_name
                AND ccu.table_schema = tc.table_schema
            JOIN information_schema.referential_constraints rc
                ON rc.constraint_name = tc.constraint_name
                AND rc.constraint_schema = tc.table_schema
            WHERE tc.table_name = $1
            AND tc.table_schema = $2
            AND tc.constraint_type = 'FOREIGN KEY'
            "#;

        pub const DESCRIBE_INDEXES: &str = r#"
            SELECT
                i.relname AS index_name,
                string_agg(a.attname, ',' ORDER BY array_position(ix.indkey, a.attnum)) AS column_names,
                ix.indisunique AS is_unique,
                ix.indisprimary AS is_primary,
                am.amname AS index_algorithm
            FROM pg_index ix
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            LEFT JOIN pg_am am ON am.oid = i.relam
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE t.relname = $1 AND n.nspname = $2
            GROUP BY i.relname, ix.indisunique, ix.indisprimary, am.amname
            "#;
    }

    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT
                CONVERT(TABLE_NAME USING utf8mb4) AS TABLE_NAME,
                CONVERT(TABLE_TYPE USING utf8mb4) AS TABLE_TYPE,
                CONVERT(TABLE_SCHEMA USING utf8mb4) AS TABLE_SCHEMA,
                CONVERT(ENGINE USING utf8mb4) AS ENGINE,
                CAST(DATA_LENGTH + COALESCE(INDEX_LENGTH, 0) AS UNSIGNED) AS TOTAL_SIZE,
                TABLE_ROWS AS ESTIMATED_ROWS,
                CONVERT(TABLE_COMMENT USING utf8mb4) AS TABLE_COMMENT
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND (TABLE_TYPE = 'BASE TABLE' OR (? AND TABLE_TYPE = 'VIEW'))
            ORDER BY TABLE_NAME
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
            SELECT
                CONVERT(COLUMN_NAME USING utf8mb4) AS COLUMN_NAME,
                CONVERT(COLUMN_TYPE USING utf8mb4) AS COLUMN_TYPE,
                CONVERT(IS_NULLABLE USING utf8mb4) AS IS_NULLABLE,
                CONVERT(COLUMN_DEFAULT USING utf8mb4) AS COLUMN_DEFAULT,
                CONVERT(COLUMN_KEY USING utf8mb4) AS COLUMN_KEY,
                CONVERT(EXTRA USING utf8mb4) AS EXTRA,
                CONVERT(COLUMN_COMMENT USING utf8mb4) AS COLUMN_COMMENT,
                CONVERT(TABLE_SCHEMA USING utf8mb4) AS TABLE_SCHEMA
            FROM information_schema.COLUMNS
            WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE())
            ORDER BY ORDINAL_POSITION
            "#;

        pub const DESCRIBE_FOREIGN_KEYS: &str = r#"
            SELECT
                CONVERT(k.COLUMN_NAME USING utf8mb4) AS COLUMN_NAME,
                CONVERT(k.REFERENCED_TABLE_NAME USING utf8mb4) AS REFERENCED_TABLE_NAME,
                CONVERT(k.REFERENCED_COLUMN_NAME USING utf8mb4) AS REFERENCED_COLUMN_NAME,
                CONVERT(r.DELETE_RULE USING utf8mb4) AS DELETE_RULE,
                CONVERT(r.UPDATE_RULE USING utf8mb4) AS UPDATE_RULE
            FROM information_schema.KEY_COLUMN_USAGE k
            JOIN information_schema.REFERENTIAL_CONSTRAINTS r
                ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
                AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
            WHERE k.TABLE_NAME = ?
            AND k.TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND k.REFERENCED_TABLE_NAME IS NOT NULL
            "#;

        pub const DESCRIBE_INDEXES: &str = r#"
            SELECT
                CONVERT(INDEX_NAME USING utf8mb4) AS INDEX_NAME,
                CONVERT(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX) USING utf8mb4) AS COLUMN_NAMES,
                NOT NON_UNIQUE AS IS_UNIQUE,
                CONVERT(INDEX_TYPE USING utf8mb4) AS INDEX_ALGORITHM
            FROM information_schema.STATISTICS
            WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE())
            GROUP BY INDEX_NAME, NON_UNIQUE, INDEX_TYPE
            "#;
    }

    pub mod sqlite {
        pub const LIST_TABLES: &str = r#"
            SELECT name, type FROM sqlite_master
            WHERE (type = 'table' OR (? AND type = 'view'))
            AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#;

        /// Needs the optional `dbstat` virtual table.
        pub const TABLE_SIZE: &str = "SELECT SUM(pgsize) AS size_bytes FROM dbstat WHERE name = ?";
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;

    const DEFAULT_SCHEMA: &str = "public";

    pub async fn list_tables<T: DriverConnection>(
        conn: &mut T,
        schema: Option<&str>,
        include_views: bool,
    ) -> DbResult<Vec<TableInfo>> {
        let schema_name = schema.unwrap_or(DEFAULT_SCHEMA);
        let rows = fetch_all(
            conn,
            queries::postgres::LIST_TABLES,
            &[param(Some(schema_name)), QueryParam::Bool(include_views)],
        )
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = non_empty(row.get_str("table_name"))?;
                let type_str = row.get_str("table_type").unwrap_or_default();
                let mut table =
                    TableInfo::new(name, TableType::parse(&type_str)).with_schema(schema_name);
                if let Some(size) = row.get_u64("total_size") {
                    table = table.with_total_size(size);
                }
                if let Some(estimate) = row.get_u64("estimated_rows") {
                    table = table.with_estimated_rows(estimate);
                }
                if let Some(comment) = non_empty(row.get_str("comment")) {
                    table = table.with_comment(comment);
                }
                Some(table)
            })
            .collect())
    }

    pub async fn describe_table<T: DriverConnection>(
        conn: &mut T,
        table_name: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        let schema_name = schema.unwrap_or(DEFAULT_SCHEMA);
        let params = [param(Some(table_name)), param(Some(schema_name))];

        let columns: Vec<ColumnDefinition> =
            fetch_all(conn, queries::postgres::DESCRIBE_COLUMNS, &params)
                .await?
                .iter()
                .map(|row| {
                    let mut col = ColumnDefinition::new(
                        row.get_str("column_name").unwrap_or_default(),
                        row.get_str("column_type").unwrap_or_default(),
                        row.get_str("is_nullable").as_deref() == Some("YES"),
                    )
                    .with_primary_key(row.get_bool("is_primary_key").unwrap_or(false));
                    if let Some(default) = row.get_str("column_default") {
                        col = col.with_default_str(&default);
                    }
                    if let Some(comment) = non_empty(row.get_str("column_comment")) {
                        col = col.with_comment(comment);
                    }
                    col
                })
                .collect();
        if columns.is_empty() {
            return Err(table_not_found(table_name));
        }

        let foreign_keys = fetch_all(conn, queries::postgres::DESCRIBE_FOREIGN_KEYS, &params)
            .await?
            .iter()
            .map(|row| {
                ForeignKey::new(
                    row.get_str("column_name").unwrap_or_default(),
                    row.get_str("foreign_table_name").unwrap_or_default(),
                    row.get_str("foreign_column_name").unwrap_or_default(),
                )
                .with_on_delete(ForeignKeyAction::parse(
                    &row.get_str("delete_rule").unwrap_or_default(),
                ))
                .with_on_update(ForeignKeyAction::parse(
                    &row.get_str("update_rule").unwrap_or_default(),
                ))
            })
            .collect();

        let indexes = fetch_optional(conn, queries::postgres::DESCRIBE_INDEXES, &params)
            .await?
            .iter()
            .filter_map(|row| {
                let columns: Vec<String> = row
                    .get_str("column_names")?
                    .split(',')
                    .map(str::to_string)
                    .collect();
                let mut idx = IndexInfo::new(row.get_str("index_name")?, columns)
                    .with_unique(row.get_bool("is_unique").unwrap_or(false))
                    .with_primary(row.get_bool("is_primary").unwrap_or(false));
                if let Some(algorithm) = non_empty(row.get_str("index_algorithm")) {
                    idx = idx.with_algorithm(algorithm);
                }
                Some(idx)
            })
            .collect();

        let mut described = TableSchema::new(table_name).with_schema(schema_name);
        described.columns = columns;
        described.foreign_keys = foreign_keys;
        described.indexes = indexes;
        Ok(described)
    }
}

mod mysql {
    use super::*;

    pub async fn list_tables<T: DriverConnection>(
        conn: &mut T,
        schema: Option<&str>,
        include_views: bool,
    ) -> DbResult<Vec<TableInfo>> {
        let rows = fetch_all(
            conn,
            queries::mysql::LIST_TABLES,
            &[param(schema), QueryParam::Bool(include_views)],
        )
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = non_empty(row.get_str("TABLE_NAME"))?;
                let type_str = row.get_str("TABLE_TYPE").unwrap_or_default();
                let table_type = TableType::parse(&type_str);
                let mut table = TableInfo::new(name, table_type);
                if let Some(schema) = non_empty(row.get_str("TABLE_SCHEMA")) {
                    table = table.with_schema(schema);
                }
                if table_type == TableType::Table {
                    if let Some(engine) = non_empty(row.get_str("ENGINE")) {
                        table = table.with_engine(engine);
                    }
                    if let Some(size) = row.get_u64("TOTAL_SIZE") {
                        table = table.with_total_size(size);
                    }
                    if let Some(estimate) = row.get_u64("ESTIMATED_ROWS") {
                        table = table.with_estimated_rows(estimate);
                    }
                }
                if let Some(comment) = non_empty(row.get_str("TABLE_COMMENT")) {
                    table = table.with_comment(comment);
                }
                Some(table)
            })
            .collect())
    }

    pub async fn describe_table<T: DriverConnection>(
        conn: &mut T,
        table_name: &str,
        schema: Option<&str>,
    ) -> DbResult<TableSchema> {
        let params = [param(Some(table_name)), param(schema)];

        let rows = fetch_all(conn, queries::mysql::DESCRIBE_COLUMNS, &params).await?;
        let Some(resolved_schema) = rows.first().and_then(|row| row.get_str("TABLE_SCHEMA")) else {
            return Err(table_not_found(table_name));
        };
        let columns = rows
            .iter()
            .map(|row| {
                let mut col = ColumnDefinition::new(
                    row.get_str("COLUMN_NAME").unwrap_or_default(),
                    row.get_str("COLUMN_TYPE").unwrap_or_default(),
                    row.get_str("IS_NULLABLE").as_deref() == Some("YES"),
                )
                .with_primary_key(row.get_str("COLUMN_KEY").as_deref() == Some("PRI"));
                if let Some(default) = row.get_str("COLUMN_DEFAULT") {
                    col = col.with_default_str(&default);
                }
                if let Some(extra) = non_empty(row.get_str("EXTRA")) {
                    col = col.with_extra(extra);
                }
                if let Some(comment) = non_empty(row.get_str("COLUMN_COMMENT")) {
                    col = col.with_comment(comment);
                }
                col
            })
            .collect();

        let foreign_keys = fetch_all(conn, queries::mysql::DESCRIBE_FOREIGN_KEYS, &params)
            .await?
            .iter()
            .map(|row| {
                ForeignKey::new(
                    row.get_str("COLUMN_NAME").unwrap_or_default(),
                    row.get_str("REFERENCED_TABLE_NAME").unwrap_or_default(),
                    row.get_str("REFERENCED_COLUMN_NAME").unwrap_or_default(),
                )
                .with_on_delete(ForeignKeyAction::parse(
                    &row.get_str("DELETE_RULE").unwrap_or_default(),
                ))
                .with_on_update(ForeignKeyAction::parse(
                    &row.get_str("UPDATE_RULE").unwrap_or_default(),
                ))
            })
            .collect();

        let indexes = fetch_optional(conn, queries::mysql::DESCRIBE_INDEXES, &params)
            .await?
            .iter()
            .filter_map(|row| {
                let name = row.get_str("INDEX_NAME")?;
                let columns = row
                    .get_str("COLUMN_NAMES")?
                    .split(',')
                    .map(str::to_string)
                    .collect();
                let is_primary = name == "PRIMARY";
                let mut idx = IndexInfo::new(name, columns)
                    .with_unique(row.get_bool("IS_UNIQUE").unwrap_or(false) || is_primary)
                    .with_primary(is_primary);
                if let Some(algorithm) = non_empty(row.get_str("INDEX_ALGORITHM")) {
                    idx = idx.with_algorithm(algorithm);
                }
                Some(idx)
            })
            .collect();

        let mut described = TableSchema::new(table_name).with_schema(resolved_schema);
        described.columns = columns;
        described.foreign_keys = foreign_keys;
        described.indexes = indexes;
        Ok(described)
    }
}

mod sqlite {
    use super::*;

    const DIALECT: SqlDialect = SqlDialect::new(EngineKind::Sqlite);

    pub async fn list_tables<T: DriverConnection>(
        conn: &mut T,
        include_views: bool,
    ) -> DbResult<Vec<TableInfo>> {
        let rows = fetch_all(conn, queries::sqlite::LIST_TABLES, &[QueryParam::Bool(include_views)])
            .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(name) = row.get_str("name") else {
                continue;
            };
            let type_str = row.get_str("type").unwrap_or_default();
            let mut table = TableInfo::new(&name, TableType::parse(&type_str));
            if type_str == "table" {
                let size = fetch_optional(
                    conn,
                    queries::sqlite::TABLE_SIZE,
                    &[QueryParam::String(name.clone())],
                )
                .await?
                .first()
                .and_then(|row| row.get_u64("size_bytes"));
                if let Some(size) = size {
                    table = table.with_total_size(size);
                }
            }
            tables.push(table);
        }
        Ok(tables)
    }

    pub async fn describe_table<T: DriverConnection>(
        conn: &mut T,
        table_name: &str,
    ) -> DbResult<TableSchema> {
        let quoted = DIALECT.quote_identifier(table_name);

        let columns: Vec<ColumnDefinition> =
            fetch_all(conn, &format!("PRAGMA table_info({})", quoted), &[])
                .await?
                .iter()
                .map(|row| {
                    let mut col = ColumnDefinition::new(
                        row.get_str("name").unwrap_or_default(),
                        row.get_str("type").unwrap_or_default(),
                        row.get_u64("notnull") == Some(0),
                    )
                    .with_primary_key(row.get_u64("pk").is_some_and(|pk| pk > 0));
                    if let Some(default) = row.get_str("dflt_value") {
                        col = col.with_default_str(&default);
                    }
                    col
                })
                .collect();
        if columns.is_empty() {
            return Err(table_not_found(table_name));
        }

        let foreign_keys = fetch_optional(conn, &format!("PRAGMA foreign_key_list({})", quoted), &[])
            .await?
            .iter()
            .map(|row| {
                ForeignKey::new(
                    row.get_str("from").unwrap_or_default(),
                    row.get_str("table").unwrap_or_default(),
                    row.get_str("to").unwrap_or_default(),
                )
                .with_on_delete(ForeignKeyAction::parse(
                    &row.get_str("on_delete").unwrap_or_default(),
                ))
                .with_on_update(ForeignKeyAction::parse(
                    &row.get_str("on_update").unwrap_or_default(),
                ))
            })
            .collect();

        let index_list = fetch_optional(conn, &format!("PRAGMA index_list({})", quoted), &[]).await?;
        let mut indexes = Vec::with_capacity(index_list.len());
        for idx_row in &index_list {
            let Some(name) = idx_row.get_str("name") else {
                continue;
            };
            let columns: Vec<String> = fetch_optional(
                conn,
                &format!("PRAGMA index_info({})", DIALECT.quote_identifier(&name)),
                &[],
            )
            .await?
            .iter()
            .filter_map(|row| row.get_str("name"))
            .collect();
            if columns.is_empty() {
                continue;
            }
            indexes.push(
                IndexInfo::new(name, columns)
                    .with_unique(idx_row.get_bool("unique").unwrap_or(false))
                    .with_primary(idx_row.get_str("origin").as_deref() == Some("pk")),
            );
        }

        let mut described = TableSchema::new(table_name);
        described.columns = columns;
        described.foreign_keys = foreign_keys;
        described.indexes = indexes;
        Ok(described)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::driver::{Connector, SqlxConnector};
    use crate::models::{AccessPolicy, DatasourceConfig, PoolSettings};
    use std::time::Duration;

    async fn sqlite_conn(dir: &tempfile::TempDir) -> <SqlxConnector as Connector>::Connection {
        let url = format!("sqlite:{}", dir.path().join("schema.db").display());
        let config = DatasourceConfig::new(
            "local",
            url,
            AccessPolicy::ReadWrite,
            None,
            PoolSettings {
                min_connections: 0,
                max_connections: 1,
                idle_timeout: Duration::from_secs(60),
                acquire_timeout: Duration::from_secs(5),
            },
        )
        .unwrap();
        let mut conn = SqlxConnector::new(&config, Duration::from_secs(5))
            .connect()
            .await
            .unwrap();
        for sql in [
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE)",
            "CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                customer_id INTEGER NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
                status TEXT DEFAULT 'open',
                total REAL
            )",
            "CREATE INDEX idx_orders_status ON orders(status)",
            "CREATE VIEW open_orders AS SELECT * FROM orders WHERE status = 'open'",
            "INSERT INTO customers (id, email) VALUES (1, 'a@example.com')",
            "INSERT INTO orders (customer_id, total) VALUES (1, 9.5), (1, 12.0)",
        ] {
            conn.execute(sql, &[]).await.unwrap();
        }
        conn
    }

    #[tokio::test]
    async fn test_sqlite_list_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;

        let tables = SchemaInspector::list_tables(&mut conn, EngineKind::Sqlite, None, false)
            .await
            .unwrap();
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "orders"]);

        let with_views = SchemaInspector::list_tables(&mut conn, EngineKind::Sqlite, None, true)
            .await
            .unwrap();
        assert!(
            with_views
                .iter()
                .any(|t| t.name == "open_orders" && t.table_type == TableType::View)
        );
    }

    #[tokio::test]
    async fn test_sqlite_describe_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;

        let described = SchemaInspector::describe_table(&mut conn, EngineKind::Sqlite, "orders", None)
            .await
            .unwrap();
        let columns: Vec<_> = described.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(columns, vec!["id", "customer_id", "status", "total"]);
        assert_eq!(described.primary_key, vec!["id"]);
        assert_eq!(described.row_count, Some(2));
        assert_eq!(
            described.columns[2].default_value,
            Some(serde_json::json!("open"))
        );

        assert_eq!(described.foreign_keys.len(), 1);
        let fk = &described.foreign_keys[0];
        assert_eq!(fk.references_table, "customers");
        assert_eq!(fk.on_delete, ForeignKeyAction::Cascade);

        assert!(described.indexes.iter().any(|i| i.name == "idx_orders_status"));
    }

    #[tokio::test]
    async fn test_sqlite_describe_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;

        let first = SchemaInspector::describe_table(&mut conn, EngineKind::Sqlite, "customers", None)
            .await
            .unwrap();
        let second = SchemaInspector::describe_table(&mut conn, EngineKind::Sqlite, "customers", None)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sqlite_unknown_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = sqlite_conn(&dir).await;

        let err = SchemaInspector::describe_table(&mut conn, EngineKind::Sqlite, "nope\"; --", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::QueryFailed { .. }));
        assert!(err.to_string().contains("not found"));
    }
}
