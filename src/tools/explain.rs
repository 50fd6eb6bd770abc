//! `explainQuery`: execution plans in each engine's native form.
//!
//! The explained statement goes through the same classifier and policy as
//! `executeQuery`, so a read-only datasource cannot be used to EXPLAIN (let
//! alone EXPLAIN ANALYZE) a write.

use crate::db::Connector;
use crate::error::{DbError, DbResult};
use crate::models::{MAX_ROW_LIMIT, QueryLimits, QueryParam};
use crate::session::SessionState;
use crate::tools::format::{Footer, OutputFormat, render};
use crate::tools::query::prepare_statement;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExplainQueryInput {
    /// Datasource id from listDatasources
    pub datasource: String,
    /// Statement to explain
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Run the statement and report actual timings. Reads only; not available on SQLite
    #[serde(default)]
    pub analyze: bool,
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainOutput {
    /// The statement that was explained
    pub sql: String,
    /// The plan SQL actually sent to the engine
    pub explain_sql: String,
    /// A JSON plan document (PostgreSQL, MySQL) or the plan rows (SQLite, MySQL ANALYZE)
    pub plan: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted: Option<String>,
    pub execution_time_ms: u64,
}

pub async fn explain_query<C: Connector>(
    session: &SessionState<C>,
    input: ExplainQueryInput,
) -> DbResult<ExplainOutput> {
    let statement = prepare_statement(session, &input.datasource, &input.sql, false)?;
    let datasource = session.datasource(&input.datasource)?;
    let dialect = datasource.dialect();

    if input.analyze {
        if !dialect.supports_explain_analyze() {
            return Err(DbError::invalid_arguments(format!(
                "{} does not support EXPLAIN ANALYZE",
                dialect.engine()
            )));
        }
        if !statement.is_read() {
            return Err(DbError::policy_denied(
                "EXPLAIN ANALYZE",
                format!(
                    "EXPLAIN ANALYZE executes the statement; only reads may be analyzed, got {}",
                    statement.classification().statement_kind
                ),
            ));
        }
    }

    let explain_sql = dialect.explain_sql(statement.sql(), input.analyze);
    let explain = statement.rewrite(explain_sql.clone());
    let executor = session.executor();
    let limits = QueryLimits {
        max_rows: Some(MAX_ROW_LIMIT),
        ..QueryLimits::default()
    }
    .resolve(executor.defaults());

    let lease = datasource
        .pool
        .acquire(datasource.pool.settings().acquire_timeout)
        .await?;
    let result = executor.execute(&explain, lease, &input.params, limits).await?;

    let columns: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
    let formatted = render(
        input.format,
        &columns,
        &result.rows,
        Footer {
            row_count: result.row_count,
            truncated: result.truncated,
            execution_time_ms: result.execution_time_ms,
        },
    );

    Ok(ExplainOutput {
        sql: statement.sql().to_string(),
        explain_sql,
        plan: plan_document(result.rows),
        formatted,
        execution_time_ms: result.execution_time_ms,
    })
}

/// Unwrap single-cell JSON plans; keep anything else as a row list.
///
/// PostgreSQL returns `QUERY PLAN` as a json column, MySQL returns
/// `EXPLAIN` as JSON text.
fn plan_document(rows: Vec<Map<String, JsonValue>>) -> JsonValue {
    if let [row] = rows.as_slice() {
        if row.len() == 1 {
            if let Some(value) = row.values().next() {
                match value {
                    JsonValue::Array(_) | JsonValue::Object(_) => return value.clone(),
                    JsonValue::String(text) => {
                        if let Ok(doc @ (JsonValue::Array(_) | JsonValue::Object(_))) =
                            serde_json::from_str::<JsonValue>(text)
                        {
                            return doc;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    JsonValue::Array(rows.into_iter().map(JsonValue::Object).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_postgres_json_plan_is_unwrapped() {
        let plan = plan_document(vec![row(json!({"QUERY PLAN": [{"Plan": {"Node Type": "Seq Scan"}}]}))]);
        assert_eq!(plan[0]["Plan"]["Node Type"], "Seq Scan");
    }

    #[test]
    fn test_mysql_text_plan_is_parsed() {
        let plan = plan_document(vec![row(json!({"EXPLAIN": "{\"query_block\": {\"select_id\": 1}}"}))]);
        assert_eq!(plan["query_block"]["select_id"], 1);
    }

    #[test]
    fn test_sqlite_rows_are_kept() {
        let plan = plan_document(vec![
            row(json!({"id": 2, "parent": 0, "detail": "SCAN orders"})),
            row(json!({"id": 3, "parent": 0, "detail": "USE TEMP B-TREE"})),
        ]);
        assert_eq!(plan.as_array().unwrap().len(), 2);
        assert_eq!(plan[0]["detail"], "SCAN orders");
    }

    #[test]
    fn test_mysql_analyze_tree_stays_text() {
        let plan = plan_document(vec![row(json!({"EXPLAIN": "-> Table scan on orders"}))]);
        assert_eq!(plan[0]["EXPLAIN"], "-> Table scan on orders");
    }
}
