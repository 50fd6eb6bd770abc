//! Statement classification.
//!
//! Turns raw SQL text into a [`StatementClassification`] using the dialect's
//! own tokenizer and parser. Nothing here ever decides by keyword matching on
//! the raw text: a `;` inside a string literal, a quoted identifier or a
//! comment is not a terminator, and a `DROP` inside a comment is not a DROP.
//!
//! Deny-by-default rules:
//! - more than one statement is `unsupported`
//! - MySQL executable comments (`/*! ... */`) are `unsupported`
//! - a read whose tree contains a nested write (data-modifying CTE,
//!   `SELECT ... INTO`, EXPLAIN of a write) takes the write's category
//! - calls to known side-effecting functions make a read `unsupported`
//! - text that does not parse is a [`ParseError`], never a fallback

use super::dialect::SqlDialect;
use super::hazard::{self, Hazard};
use crate::error::DbError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::collections::HashSet;
use std::ops::ControlFlow;

/// Functions that change server or session state even inside a SELECT.
const SIDE_EFFECT_FUNCTIONS: &[&str] = &[
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "set_config",
    "nextval",
    "setval",
    "lo_import",
    "lo_export",
    "lo_unlink",
    "dblink_exec",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_sleep",
    "load_file",
    "sleep",
    "benchmark",
    "get_lock",
    "release_lock",
    "load_extension",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StatementCategory {
    Read,
    Mutate,
    Ddl,
    Unsupported,
}

impl StatementCategory {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Mutate | Self::Ddl)
    }
}

impl std::fmt::Display for StatementCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Mutate => "mutate",
            Self::Ddl => "ddl",
            Self::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// What the classifier learned about one piece of SQL.
///
/// `allowed` starts out `false` and is only set by `policy::evaluate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatementClassification {
    pub category: StatementCategory,
    /// Leading statement keyword(s), e.g. `SELECT`, `DELETE`, `CREATE TABLE`
    pub statement_kind: String,
    /// Tables referenced, in first-seen order, CTE names excluded
    pub tables: Vec<String>,
    /// References the analysis could not resolve to a table (table functions, UNNEST, ...)
    #[serde(skip_serializing_if = "is_zero")]
    pub unresolved_references: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hazard: Option<Hazard>,
    /// Whether executing the statement yields a result set (reads, RETURNING)
    pub returns_rows: bool,
    /// Why the category differs from what the leading keyword suggests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub allowed: bool,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl StatementClassification {
    fn unsupported(kind: &str, note: impl Into<String>) -> Self {
        Self {
            category: StatementCategory::Unsupported,
            statement_kind: kind.to_string(),
            tables: Vec::new(),
            unresolved_references: 0,
            hazard: None,
            returns_rows: false,
            note: Some(note.into()),
            allowed: false,
        }
    }
}

/// SQL that could not be parsed, with a 1-based position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} (line {line}, column {column})")]
pub struct ParseError {
    pub reason: String,
    pub line: u64,
    pub column: u64,
}

impl ParseError {
    fn empty() -> Self {
        Self {
            reason: "Empty SQL statement".to_string(),
            line: 1,
            column: 1,
        }
    }
}

impl From<ParserError> for ParseError {
    fn from(err: ParserError) -> Self {
        let reason = err.to_string();
        Self {
            line: number_after(&reason, "Line: ").unwrap_or(1),
            column: number_after(&reason, "Column: ").unwrap_or(1),
            reason,
        }
    }
}

impl From<ParseError> for DbError {
    fn from(err: ParseError) -> Self {
        DbError::parse(err.reason, err.line, err.column)
    }
}

fn number_after(message: &str, marker: &str) -> Option<u64> {
    let start = message.rfind(marker)? + marker.len();
    let digits: String = message[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Classify `sql` under the grammar of `dialect`.
pub fn classify(sql: &str, dialect: &SqlDialect) -> Result<StatementClassification, ParseError> {
    if sql.trim().is_empty() {
        return Err(ParseError::empty());
    }

    match scan_terminators(sql, dialect) {
        Scan::Single => {}
        Scan::Multiple => {
            return Ok(StatementClassification::unsupported(
                "MULTI-STATEMENT",
                "Only one statement per request is allowed",
            ));
        }
        Scan::ExecutableComment => {
            return Ok(StatementClassification::unsupported(
                "EXECUTABLE COMMENT",
                "MySQL executable comments (/*! ... */) are not allowed",
            ));
        }
    }

    let statements = Parser::parse_sql(dialect.parser_dialect(), sql)?;
    let statement = match statements.as_slice() {
        [] => return Err(ParseError::empty()),
        [single] => single,
        _ => {
            return Ok(StatementClassification::unsupported(
                "MULTI-STATEMENT",
                "Only one statement per request is allowed",
            ));
        }
    };

    Ok(classify_statement(statement))
}

fn classify_statement(statement: &Statement) -> StatementClassification {
    let (mut category, mut kind) = statement_category(statement);
    let mut visitor = StatementVisitor::default();
    let _ = statement.visit(&mut visitor);

    let mut note = None;
    if category == StatementCategory::Read {
        if let Some((nested_category, nested_kind)) = visitor.nested {
            category = nested_category;
            note = Some(format!("Contains a nested {} statement", nested_kind));
        } else if visitor.select_into {
            category = StatementCategory::Mutate;
            kind = "SELECT INTO";
        } else if let Some(function) = visitor.side_effect_function.take() {
            category = StatementCategory::Unsupported;
            note = Some(format!("Calls side-effecting function {}()", function));
        }
    }

    let cte_names = visitor.cte_names;
    let tables = visitor
        .relations
        .into_iter()
        .filter(|name| !cte_names.contains(&name.to_lowercase()))
        .collect();

    StatementClassification {
        category,
        statement_kind: kind.to_string(),
        tables,
        unresolved_references: visitor.unresolved,
        hazard: visitor.hazard,
        returns_rows: returns_rows(statement),
        note,
        allowed: false,
    }
}

enum Scan {
    Single,
    Multiple,
    ExecutableComment,
}

/// Find statement terminators with the dialect tokenizer.
///
/// One trailing `;` followed only by whitespace and comments is accepted.
fn scan_terminators(sql: &str, dialect: &SqlDialect) -> Scan {
    let tokens = match Tokenizer::new(dialect.parser_dialect(), sql).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => return scan_terminators_raw(sql, dialect),
    };

    if dialect.has_executable_comments() && hides_executable_comment(sql, &tokens) {
        return Scan::ExecutableComment;
    }

    let mut seen_terminator = false;
    for token in &tokens {
        match token {
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon if !seen_terminator => seen_terminator = true,
            _ if seen_terminator => return Scan::Multiple,
            _ => {}
        }
    }
    Scan::Single
}

/// `/*!` text that is not inside a literal or identifier.
///
/// Compares raw occurrences against occurrences inside non-comment tokens, so
/// this holds whether the tokenizer keeps such comments or unwraps them.
fn hides_executable_comment(sql: &str, tokens: &[Token]) -> bool {
    let raw = sql.matches("/*!").count();
    if raw == 0 {
        return false;
    }
    let quoted: usize = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(Whitespace::MultiLineComment(_))))
        .map(|t| t.to_string().matches("/*!").count())
        .sum();
    raw > quoted
}

/// Used only when the tokenizer rejects the text; the parser will reject it
/// too, but multi-statement input must still be reported as such.
fn scan_terminators_raw(sql: &str, dialect: &SqlDialect) -> Scan {
    if dialect.has_executable_comments() && sql.contains("/*!") {
        return Scan::ExecutableComment;
    }
    match sql.find(';') {
        Some(pos) if !sql[pos + 1..].trim().is_empty() => Scan::Multiple,
        _ => Scan::Single,
    }
}

#[derive(Default)]
struct StatementVisitor {
    statements_seen: usize,
    nested: Option<(StatementCategory, &'static str)>,
    select_into: bool,
    hazard: Option<Hazard>,
    side_effect_function: Option<String>,
    relations: Vec<String>,
    cte_names: HashSet<String>,
    unresolved: usize,
}

impl Visitor for StatementVisitor {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        self.statements_seen += 1;
        if self.hazard.is_none() {
            self.hazard = hazard::detect(statement);
        }
        // The first statement is the root; anything after it is nested.
        if self.statements_seen > 1 && self.nested.is_none() {
            let (category, kind) = statement_category(statement);
            if category != StatementCategory::Read {
                self.nested = Some((category, kind));
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        if selects_into(&query.body) {
            self.select_into = true;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let name = relation.to_string();
        if !self.relations.contains(&name) {
            self.relations.push(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { .. }
            | TableFactor::Derived { .. }
            | TableFactor::NestedJoin { .. } => {}
            _ => self.unresolved += 1,
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            if self.side_effect_function.is_none() {
                let full = function.name.to_string();
                let short = full
                    .rsplit('.')
                    .next()
                    .unwrap_or(&full)
                    .trim_matches(|c| c == '"' || c == '`')
                    .to_lowercase();
                if SIDE_EFFECT_FUNCTIONS.contains(&short.as_str()) {
                    self.side_effect_function = Some(short);
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// A `SELECT ... INTO` anywhere in a body, including either side of a set operation.
fn selects_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::Query(query) => selects_into(&query.body),
        SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        _ => false,
    }
}

fn returns_rows(statement: &Statement) -> bool {
    match statement {
        Statement::Insert(insert) => insert.returning.is_some(),
        Statement::Update(update) => update.returning.is_some(),
        Statement::Delete(delete) => delete.returning.is_some(),
        Statement::Explain { .. } | Statement::ExplainTable { .. } => true,
        // WITH ... DELETE parses as a query whose body is the write
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Insert(inner)
            | SetExpr::Update(inner)
            | SetExpr::Delete(inner)
            | SetExpr::Merge(inner) => returns_rows(inner),
            _ => true,
        },
        other => statement_category(other).0 == StatementCategory::Read,
    }
}

/// Category and display name of a statement by its top-level form.
fn statement_category(stmt: &Statement) -> (StatementCategory, &'static str) {
    use StatementCategory::*;

    match stmt {
        Statement::Query(_) => (Read, "SELECT"),
        Statement::ShowTables { .. } => (Read, "SHOW TABLES"),
        Statement::ShowColumns { .. } => (Read, "SHOW COLUMNS"),
        Statement::ShowDatabases { .. } => (Read, "SHOW DATABASES"),
        Statement::ShowSchemas { .. } => (Read, "SHOW SCHEMAS"),
        Statement::ShowCreate { .. } => (Read, "SHOW CREATE"),
        Statement::ShowFunctions { .. } => (Read, "SHOW FUNCTIONS"),
        Statement::ShowVariable { .. } => (Read, "SHOW VARIABLE"),
        Statement::ShowVariables { .. } => (Read, "SHOW VARIABLES"),
        Statement::ShowStatus { .. } => (Read, "SHOW STATUS"),
        Statement::ShowCollation { .. } => (Read, "SHOW COLLATION"),
        Statement::ExplainTable { .. } => (Read, "EXPLAIN TABLE"),

        // EXPLAIN of a write takes the write's category: ANALYZE runs it.
        Statement::Explain { statement, .. } => match statement_category(statement) {
            (Read, _) => (Read, "EXPLAIN"),
            inner => inner,
        },

        Statement::Insert(_) => (Mutate, "INSERT"),
        Statement::Update { .. } => (Mutate, "UPDATE"),
        Statement::Delete(_) => (Mutate, "DELETE"),
        Statement::Merge { .. } => (Mutate, "MERGE"),
        Statement::Copy { .. } => (Mutate, "COPY"),
        Statement::CopyIntoSnowflake { .. } => (Mutate, "COPY INTO"),
        Statement::Truncate { .. } => (Mutate, "TRUNCATE"),

        Statement::CreateTable { .. } => (Ddl, "CREATE TABLE"),
        Statement::CreateView { .. } => (Ddl, "CREATE VIEW"),
        Statement::CreateIndex(_) => (Ddl, "CREATE INDEX"),
        Statement::CreateSchema { .. } => (Ddl, "CREATE SCHEMA"),
        Statement::CreateDatabase { .. } => (Ddl, "CREATE DATABASE"),
        Statement::CreateSequence { .. } => (Ddl, "CREATE SEQUENCE"),
        Statement::CreateType { .. } => (Ddl, "CREATE TYPE"),
        Statement::CreateFunction { .. } => (Ddl, "CREATE FUNCTION"),
        Statement::CreateProcedure { .. } => (Ddl, "CREATE PROCEDURE"),
        Statement::CreateTrigger { .. } => (Ddl, "CREATE TRIGGER"),
        Statement::CreateRole { .. } => (Ddl, "CREATE ROLE"),
        Statement::CreateVirtualTable { .. } => (Ddl, "CREATE VIRTUAL TABLE"),
        Statement::CreateExtension { .. } => (Ddl, "CREATE EXTENSION"),
        Statement::CreatePolicy { .. } => (Ddl, "CREATE POLICY"),
        Statement::AlterTable { .. } => (Ddl, "ALTER TABLE"),
        Statement::AlterView { .. } => (Ddl, "ALTER VIEW"),
        Statement::AlterIndex { .. } => (Ddl, "ALTER INDEX"),
        Statement::AlterSchema { .. } => (Ddl, "ALTER SCHEMA"),
        Statement::AlterRole { .. } => (Ddl, "ALTER ROLE"),
        Statement::AlterPolicy { .. } => (Ddl, "ALTER POLICY"),
        Statement::AlterType { .. } => (Ddl, "ALTER TYPE"),
        Statement::Drop { .. } => (Ddl, "DROP"),
        Statement::DropFunction { .. } => (Ddl, "DROP FUNCTION"),
        Statement::DropProcedure { .. } => (Ddl, "DROP PROCEDURE"),
        Statement::DropTrigger { .. } => (Ddl, "DROP TRIGGER"),
        Statement::DropPolicy { .. } => (Ddl, "DROP POLICY"),
        Statement::Comment { .. } => (Ddl, "COMMENT"),
        Statement::Grant { .. } => (Ddl, "GRANT"),
        Statement::Revoke { .. } => (Ddl, "REVOKE"),

        // Session, transaction and procedural statements escape per-request
        // isolation on a pooled connection.
        Statement::StartTransaction { .. } => (Unsupported, "BEGIN"),
        Statement::Commit { .. } => (Unsupported, "COMMIT"),
        Statement::Rollback { .. } => (Unsupported, "ROLLBACK"),
        Statement::Savepoint { .. } => (Unsupported, "SAVEPOINT"),
        Statement::ReleaseSavepoint { .. } => (Unsupported, "RELEASE SAVEPOINT"),
        Statement::Call { .. } => (Unsupported, "CALL"),
        Statement::Execute { .. } => (Unsupported, "EXECUTE"),
        Statement::Prepare { .. } => (Unsupported, "PREPARE"),
        Statement::Deallocate { .. } => (Unsupported, "DEALLOCATE"),
        Statement::Set(_) => (Unsupported, "SET"),
        Statement::Use(_) => (Unsupported, "USE"),
        Statement::Kill { .. } => (Unsupported, "KILL"),
        Statement::Vacuum { .. } => (Unsupported, "VACUUM"),
        Statement::Analyze { .. } => (Unsupported, "ANALYZE"),
        Statement::Discard { .. } => (Unsupported, "DISCARD"),
        Statement::LockTables { .. } => (Unsupported, "LOCK"),
        Statement::UnlockTables => (Unsupported, "UNLOCK"),
        Statement::Flush { .. } => (Unsupported, "FLUSH"),
        Statement::Pragma { .. } => (Unsupported, "PRAGMA"),
        Statement::Load { .. } => (Unsupported, "LOAD"),
        Statement::Install { .. } => (Unsupported, "INSTALL"),
        Statement::OptimizeTable { .. } => (Unsupported, "OPTIMIZE"),
        Statement::AttachDatabase { .. } => (Unsupported, "ATTACH"),
        Statement::LISTEN { .. } => (Unsupported, "LISTEN"),
        Statement::UNLISTEN { .. } => (Unsupported, "UNLISTEN"),
        Statement::NOTIFY { .. } => (Unsupported, "NOTIFY"),

        _ => (Unsupported, "UNKNOWN"),
    }
}
