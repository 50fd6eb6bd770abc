//! Engine dialect descriptors.
//!
//! A [`SqlDialect`] bundles everything that differs between engines at the SQL
//! level: the parser grammar, identifier quoting, placeholder syntax and the
//! EXPLAIN prefix. Adding an engine means adding a descriptor here and a driver
//! adapter in `db::driver`, not branching through the classifier or executor.

use crate::models::EngineKind;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};

static MYSQL: MySqlDialect = MySqlDialect {};
static POSTGRES: PostgreSqlDialect = PostgreSqlDialect {};
static SQLITE: SQLiteDialect = SQLiteDialect {};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDialect {
    engine: EngineKind,
}

impl SqlDialect {
    pub const fn new(engine: EngineKind) -> Self {
        Self { engine }
    }

    /// Look up a dialect by engine name (`mysql`, `postgres`, `sqlite`, and aliases).
    pub fn from_name(name: &str) -> Option<Self> {
        EngineKind::from_name(name).map(Self::new)
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Grammar used by the parser and tokenizer.
    pub fn parser_dialect(&self) -> &'static dyn Dialect {
        match self.engine {
            EngineKind::MySql => &MYSQL,
            EngineKind::Postgres => &POSTGRES,
            EngineKind::Sqlite => &SQLITE,
        }
    }

    /// MySQL runs the body of `/*! ... */` comments as SQL.
    pub fn has_executable_comments(&self) -> bool {
        matches!(self.engine, EngineKind::MySql)
    }

    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_identifier(&self, ident: &str) -> String {
        match self.engine {
            EngineKind::MySql => format!("`{}`", ident.replace('`', "``")),
            EngineKind::Postgres | EngineKind::Sqlite => {
                format!("\"{}\"", ident.replace('"', "\"\""))
            }
        }
    }

    /// Quote a possibly schema-qualified name.
    pub fn quote_qualified(&self, schema: Option<&str>, name: &str) -> String {
        match schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(name)
            ),
            None => self.quote_identifier(name),
        }
    }

    /// Positional placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self.engine {
            EngineKind::Postgres => format!("${}", index),
            EngineKind::MySql | EngineKind::Sqlite => "?".to_string(),
        }
    }

    /// Wrap a statement in the engine's plan-producing EXPLAIN form.
    ///
    /// - PostgreSQL: `EXPLAIN (FORMAT JSON)`, or `EXPLAIN (ANALYZE, FORMAT JSON)`
    /// - MySQL: `EXPLAIN FORMAT=JSON`, or `EXPLAIN ANALYZE` (text tree)
    /// - SQLite: `EXPLAIN QUERY PLAN` (no analyze mode)
    pub fn explain_sql(&self, sql: &str, analyze: bool) -> String {
        let sql = sql.trim().trim_end_matches(';');
        match (self.engine, analyze) {
            (EngineKind::Postgres, false) => format!("EXPLAIN (FORMAT JSON) {}", sql),
            (EngineKind::Postgres, true) => format!("EXPLAIN (ANALYZE, FORMAT JSON) {}", sql),
            (EngineKind::MySql, false) => format!("EXPLAIN FORMAT=JSON {}", sql),
            (EngineKind::MySql, true) => format!("EXPLAIN ANALYZE {}", sql),
            (EngineKind::Sqlite, _) => format!("EXPLAIN QUERY PLAN {}", sql),
        }
    }

    pub fn supports_explain_analyze(&self) -> bool {
        !matches!(self.engine, EngineKind::Sqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_escapes() {
        let pg = SqlDialect::new(EngineKind::Postgres);
        assert_eq!(pg.quote_identifier("order"), "\"order\"");
        assert_eq!(pg.quote_identifier("we\"ird"), "\"we\"\"ird\"");

        let my = SqlDialect::new(EngineKind::MySql);
        assert_eq!(my.quote_identifier("a`b"), "`a``b`");
        assert_eq!(my.quote_qualified(Some("shop"), "orders"), "`shop`.`orders`");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(SqlDialect::new(EngineKind::Postgres).placeholder(2), "$2");
        assert_eq!(SqlDialect::new(EngineKind::MySql).placeholder(2), "?");
    }

    #[test]
    fn test_explain_sql_per_engine() {
        let sql = "SELECT * FROM t;";
        assert_eq!(
            SqlDialect::new(EngineKind::Postgres).explain_sql(sql, true),
            "EXPLAIN (ANALYZE, FORMAT JSON) SELECT * FROM t"
        );
        assert_eq!(
            SqlDialect::new(EngineKind::MySql).explain_sql(sql, false),
            "EXPLAIN FORMAT=JSON SELECT * FROM t"
        );
        assert_eq!(
            SqlDialect::new(EngineKind::Sqlite).explain_sql(sql, true),
            "EXPLAIN QUERY PLAN SELECT * FROM t"
        );
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            SqlDialect::from_name("postgresql").map(|d| d.engine()),
            Some(EngineKind::Postgres)
        );
        assert!(SqlDialect::from_name("oracle").is_none());
    }
}
