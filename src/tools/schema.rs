//! Catalog tools: `listDatasources`, `listTables` and `describeTable`.
//!
//! These never see caller SQL. They run fixed metadata queries, so they skip
//! the classifier and are allowed under every policy.

use crate::db::{Connector, PoolStats, SchemaInspector, settle_lease, with_time_limit};
use crate::error::{DbError, DbResult};
use crate::models::{DatasourceInfo, TableInfo, TableSchema};
use crate::session::SessionState;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListDatasourcesInput {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceSummary {
    #[serde(flatten)]
    pub info: DatasourceInfo,
    pub pool: PoolStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDatasourcesOutput {
    pub datasources: Vec<DatasourceSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListTablesInput {
    /// Datasource id from listDatasources
    pub datasource: String,
    /// Schema to list. Default: `public` on PostgreSQL, the connection's database on MySQL
    #[serde(default)]
    pub schema: Option<String>,
    /// Include views in the result. Default: true
    #[serde(default = "default_true")]
    pub include_views: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTablesOutput {
    pub datasource: String,
    pub tables: Vec<TableInfo>,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeTableInput {
    /// Datasource id from listDatasources
    pub datasource: String,
    /// Table name, unquoted
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
}

fn default_true() -> bool {
    true
}

fn required(value: &str, field: &str) -> DbResult<()> {
    if value.trim().is_empty() {
        return Err(DbError::invalid_arguments(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub fn list_datasources<C: Connector>(
    session: &SessionState<C>,
    _input: ListDatasourcesInput,
) -> ListDatasourcesOutput {
    let datasources: Vec<_> = session
        .datasources()
        .map(|ds| DatasourceSummary {
            info: ds.config.info(),
            pool: ds.pool.stats(),
        })
        .collect();
    ListDatasourcesOutput {
        count: datasources.len(),
        datasources,
    }
}

pub async fn list_tables<C: Connector>(
    session: &SessionState<C>,
    input: ListTablesInput,
) -> DbResult<ListTablesOutput> {
    required(&input.datasource, "datasource")?;
    let datasource = session.datasource(&input.datasource)?;
    let engine = datasource.config.engine;
    let limit = session.executor().defaults().max_execution_time;

    let mut lease = datasource.pool.acquire(datasource.pool.settings().acquire_timeout).await?;
    let outcome = with_time_limit(
        limit,
        SchemaInspector::list_tables(
            lease.connection(),
            engine,
            input.schema.as_deref(),
            input.include_views,
        ),
    )
    .await;
    settle_lease(lease, &outcome);
    let tables = outcome?;

    info!(datasource = %input.datasource, count = tables.len(), "Listed tables");
    Ok(ListTablesOutput {
        datasource: input.datasource,
        count: tables.len(),
        tables,
    })
}

pub async fn describe_table<C: Connector>(
    session: &SessionState<C>,
    input: DescribeTableInput,
) -> DbResult<TableSchema> {
    required(&input.datasource, "datasource")?;
    required(&input.table, "table")?;
    let datasource = session.datasource(&input.datasource)?;
    let engine = datasource.config.engine;
    let limit = session.executor().defaults().max_execution_time;

    let mut lease = datasource.pool.acquire(datasource.pool.settings().acquire_timeout).await?;
    let outcome = with_time_limit(
        limit,
        SchemaInspector::describe_table(
            lease.connection(),
            engine,
            &input.table,
            input.schema.as_deref(),
        ),
    )
    .await;
    settle_lease(lease, &outcome);

    let described = outcome?;
    info!(
        datasource = %input.datasource,
        table = %described.qualified_name(),
        columns = described.columns.len(),
        "Described table"
    );
    Ok(described)
}
