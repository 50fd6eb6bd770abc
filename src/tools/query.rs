//! `executeQuery`: the only tool that runs caller-supplied SQL.
//!
//! Pipeline: validate arguments, resolve the datasource, classify the SQL with
//! the datasource's dialect, apply the policy, lease a connection, execute
//! under limits, render.

use crate::db::Connector;
use crate::error::{DbError, DbResult};
use crate::models::{QueryLimits, QueryParam, ResultSet};
use crate::session::SessionState;
use crate::sql::{AuthorizedStatement, PolicyContext, authorize, classify};
use crate::tools::format::{Footer, OutputFormat, render};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteQueryInput {
    /// Datasource id from listDatasources
    pub datasource: String,
    /// One SQL statement. Multiple statements are rejected.
    pub sql: String,
    /// Positional parameters (? for MySQL/SQLite, $1, $2... for PostgreSQL)
    #[serde(default)]
    pub params: Vec<QueryParam>,
    #[serde(default)]
    pub limits: QueryLimits,
    /// Also render rows as text: "table" (ASCII) or "markdown". Default: "json"
    #[serde(default)]
    pub format: OutputFormat,
    /// Required for DROP, TRUNCATE, ALTER TABLE ... DROP COLUMN and DELETE/UPDATE without WHERE
    #[serde(default)]
    pub allow_dangerous: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    #[serde(flatten)]
    pub result: ResultSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
}

impl QueryOutput {
    pub fn new(result: ResultSet, format: OutputFormat) -> Self {
        let columns: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
        let formatted = render(
            format,
            &columns,
            &result.rows,
            Footer {
                row_count: result.row_count,
                truncated: result.truncated,
                execution_time_ms: result.execution_time_ms,
            },
        );
        Self { result, formatted }
    }
}

/// Classify and authorize `sql` for a datasource.
pub(crate) fn prepare_statement<C: Connector>(
    session: &SessionState<C>,
    datasource_id: &str,
    sql: &str,
    allow_dangerous: bool,
) -> DbResult<AuthorizedStatement> {
    if datasource_id.trim().is_empty() {
        return Err(DbError::invalid_arguments("datasource must not be empty"));
    }
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(DbError::invalid_arguments("sql must not be empty"));
    }

    let datasource = session.datasource(datasource_id)?;
    let classification = classify(sql, &datasource.dialect())?;
    if classification.unresolved_references > 0 {
        debug!(
            datasource = %datasource_id,
            unresolved = classification.unresolved_references,
            tables = ?classification.tables,
            "Statement has unresolved table references"
        );
    }

    let ctx = PolicyContext::new(datasource.config.policy, allow_dangerous);
    authorize(sql, classification, ctx)
}

pub async fn execute_query<C: Connector>(
    session: &SessionState<C>,
    input: ExecuteQueryInput,
) -> DbResult<QueryOutput> {
    let statement =
        prepare_statement(session, &input.datasource, &input.sql, input.allow_dangerous)?;
    let datasource = session.datasource(&input.datasource)?;
    let executor = session.executor();
    let limits = input.limits.resolve(executor.defaults());

    let lease = datasource
        .pool
        .acquire(datasource.pool.settings().acquire_timeout)
        .await?;
    let result = executor
        .execute(&statement, lease, &input.params, limits)
        .await?;

    info!(
        datasource = %input.datasource,
        category = %statement.classification().category,
        statement = %statement.classification().statement_kind,
        rows = result.row_count,
        rows_affected = ?result.rows_affected,
        truncated = result.truncated,
        elapsed_ms = result.execution_time_ms,
        "Query executed"
    );
    Ok(QueryOutput::new(result, input.format))
}
