//! `parseSql`: classification without execution.

use crate::db::Connector;
use crate::error::{DbError, DbResult};
use crate::models::{AccessPolicy, EngineKind};
use crate::session::SessionState;
use crate::sql::{PolicyContext, SqlDialect, StatementClassification, classify, evaluate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ParseSqlInput {
    pub sql: String,
    /// Evaluate against this datasource's dialect and access policy
    #[serde(default)]
    pub datasource: Option<String>,
    /// mysql, postgres or sqlite; used when no datasource is given. Default: postgres
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default)]
    pub allow_dangerous: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSqlOutput {
    pub dialect: EngineKind,
    /// Policy the verdict was computed against
    pub policy: AccessPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource: Option<String>,
    #[serde(flatten)]
    pub classification: StatementClassification,
}

pub fn parse_sql<C: Connector>(
    session: &SessionState<C>,
    input: ParseSqlInput,
) -> DbResult<ParseSqlOutput> {
    if input.datasource.is_some() && input.dialect.is_some() {
        return Err(DbError::invalid_arguments(
            "Pass either datasource or dialect, not both",
        ));
    }

    let (dialect, policy) = match input.datasource.as_deref() {
        Some(id) => {
            let datasource = session.datasource(id)?;
            (datasource.dialect(), datasource.config.policy)
        }
        None => {
            let dialect = match input.dialect.as_deref() {
                Some(name) => SqlDialect::from_name(name).ok_or_else(|| {
                    DbError::invalid_arguments(format!(
                        "Unknown dialect '{name}'. Expected mysql, postgres or sqlite"
                    ))
                })?,
                None => SqlDialect::new(EngineKind::Postgres),
            };
            (dialect, AccessPolicy::ReadOnly)
        }
    };

    let classification = classify(&input.sql, &dialect)?;
    let classification = evaluate(
        classification,
        PolicyContext::new(policy, input.allow_dangerous),
    );

    Ok(ParseSqlOutput {
        dialect: dialect.engine(),
        policy,
        datasource: input.datasource,
        classification,
    })
}
