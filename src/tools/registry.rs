//! Tool registry.
//!
//! The catalogue is a closed enum: each [`ToolKind`] names one handler, its
//! input type and its description. Configuration can switch tools off; a
//! disabled tool is absent from `listTools` and dispatches as unknown.

use crate::db::Connector;
use crate::error::{DbError, DbResult, ErrorKind};
use crate::session::SessionState;
use crate::tools::explain::{self, ExplainQueryInput};
use crate::tools::parse::{self, ParseSqlInput};
use crate::tools::query::{self, ExecuteQueryInput};
use crate::tools::schema::{self, DescribeTableInput, ListDatasourcesInput, ListTablesInput};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Instant;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ListDatasources,
    ListTables,
    DescribeTable,
    ExecuteQuery,
    ExplainQuery,
    ParseSql,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        Self::ListDatasources,
        Self::ListTables,
        Self::DescribeTable,
        Self::ExecuteQuery,
        Self::ExplainQuery,
        Self::ParseSql,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ListDatasources => "listDatasources",
            Self::ListTables => "listTables",
            Self::DescribeTable => "describeTable",
            Self::ExecuteQuery => "executeQuery",
            Self::ExplainQuery => "explainQuery",
            Self::ParseSql => "parseSql",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ListDatasources => {
                "List the configured datasources.\nReturns ids, engines, access policy and pool state. Use the id as `datasource` in other tools."
            }
            Self::ListTables => {
                "List tables in a datasource.\nReturns name, type, schema, size and row-count estimates where the engine provides them."
            }
            Self::DescribeTable => {
                "Describe a table's structure.\nReturns columns in ordinal order, primary key, foreign keys, indexes and an exact row count."
            }
            Self::ExecuteQuery => {
                "Execute one SQL statement.\nRead-only datasources accept only reads. DROP, TRUNCATE, ALTER TABLE ... DROP COLUMN and DELETE/UPDATE without WHERE need allowDangerous.\nUse positional params (? or $1) instead of inlining values. Output format: json (default), table, or markdown."
            }
            Self::ExplainQuery => {
                "Show the execution plan for a SQL statement.\nThe statement is checked like executeQuery. analyze=true runs it and is allowed only for reads."
            }
            Self::ParseSql => {
                "Classify a SQL statement without running it.\nReturns the category (read, mutate, ddl, unsupported), referenced tables, and whether the datasource's policy would allow it."
            }
        }
    }

    fn input_schema(&self) -> JsonValue {
        let schema = match self {
            Self::ListDatasources => schemars::schema_for!(ListDatasourcesInput),
            Self::ListTables => schemars::schema_for!(ListTablesInput),
            Self::DescribeTable => schemars::schema_for!(DescribeTableInput),
            Self::ExecuteQuery => schemars::schema_for!(ExecuteQueryInput),
            Self::ExplainQuery => schemars::schema_for!(ExplainQueryInput),
            Self::ParseSql => schemars::schema_for!(ParseSqlInput),
        };
        serde_json::to_value(schema).unwrap_or(JsonValue::Null)
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry of the `listTools` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: JsonValue,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    enabled: Vec<ToolKind>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self {
            enabled: ToolKind::ALL.to_vec(),
        }
    }
}

impl ToolRegistry {
    /// Build the registry with the named tools switched off.
    ///
    /// Unknown names are a configuration error rather than silently ignored.
    pub fn new<S: AsRef<str>>(disabled: &[S]) -> DbResult<Self> {
        let mut enabled = ToolKind::ALL.to_vec();
        for name in disabled {
            let name = name.as_ref();
            let kind = ToolKind::from_name(name)
                .ok_or_else(|| DbError::config(format!("Cannot disable unknown tool '{}'", name)))?;
            enabled.retain(|k| *k != kind);
        }
        Ok(Self { enabled })
    }

    pub fn enabled(&self) -> &[ToolKind] {
        &self.enabled
    }

    pub fn resolve(&self, name: &str) -> DbResult<ToolKind> {
        ToolKind::from_name(name)
            .filter(|kind| self.enabled.contains(kind))
            .ok_or_else(|| DbError::unknown_tool(name))
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.enabled
            .iter()
            .map(|kind| ToolDescriptor {
                name: kind.name().to_string(),
                description: kind.description().to_string(),
                input_schema: kind.input_schema(),
            })
            .collect()
    }

    /// Validate `arguments` against the tool's input type and run it.
    ///
    /// Arguments are fully decoded before any handler runs, so malformed
    /// input never reaches a pool.
    pub async fn dispatch<C: Connector>(
        &self,
        tool: &str,
        arguments: JsonValue,
        session: &SessionState<C>,
    ) -> DbResult<JsonValue> {
        let kind = self.resolve(tool)?;
        let start = Instant::now();

        let result = async {
            match kind {
                ToolKind::ListDatasources => {
                    let input: ListDatasourcesInput = parse_arguments(arguments)?;
                    to_json(schema::list_datasources(session, input))
                }
                ToolKind::ListTables => {
                    let input = parse_arguments(arguments)?;
                    to_json(schema::list_tables(session, input).await?)
                }
                ToolKind::DescribeTable => {
                    let input = parse_arguments(arguments)?;
                    to_json(schema::describe_table(session, input).await?)
                }
                ToolKind::ExecuteQuery => {
                    let input = parse_arguments(arguments)?;
                    to_json(query::execute_query(session, input).await?)
                }
                ToolKind::ExplainQuery => {
                    let input = parse_arguments(arguments)?;
                    to_json(explain::explain_query(session, input).await?)
                }
                ToolKind::ParseSql => {
                    let input = parse_arguments(arguments)?;
                    to_json(parse::parse_sql(session, input)?)
                }
            }
        }
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(tool = %kind, elapsed_ms, "Tool call completed"),
            Err(e) if e.kind() == ErrorKind::Internal => {
                error!(tool = %kind, elapsed_ms, error = %e, "Tool call failed")
            }
            Err(e) => debug!(tool = %kind, elapsed_ms, kind = %e.kind(), error = %e, "Tool call rejected"),
        }
        result
    }
}

/// Decode tool arguments. A missing or null argument object counts as empty.
fn parse_arguments<T: DeserializeOwned>(arguments: JsonValue) -> DbResult<T> {
    let arguments = match arguments {
        JsonValue::Null => JsonValue::Object(Default::default()),
        JsonValue::Object(map) => JsonValue::Object(map),
        other => {
            return Err(DbError::invalid_arguments(format!(
                "arguments must be an object, got {}",
                json_type_name(&other)
            )));
        }
    };
    serde_json::from_value(arguments).map_err(|e| DbError::invalid_arguments(e.to_string()))
}

fn to_json<T: Serialize>(output: T) -> DbResult<JsonValue> {
    serde_json::to_value(output)
        .map_err(|e| DbError::internal(format!("Failed to serialize output: {}", e)))
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("dropEverything"), None);
    }

    #[test]
    fn test_disabled_tool_is_unknown() {
        let registry = ToolRegistry::new(&["executeQuery"]).unwrap();
        let err = registry.resolve("executeQuery").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTool);
        assert!(registry.resolve("listTables").is_ok());
        assert!(
            registry
                .descriptors()
                .iter()
                .all(|d| d.name != "executeQuery")
        );
    }

    #[test]
    fn test_disabling_unknown_tool_is_config_error() {
        let err = ToolRegistry::new(&["nope"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn test_descriptors_carry_input_schema() {
        let descriptors = ToolRegistry::default().descriptors();
        assert_eq!(descriptors.len(), ToolKind::ALL.len());
        let execute = descriptors
            .iter()
            .find(|d| d.name == "executeQuery")
            .unwrap();
        let properties = &execute.input_schema["properties"];
        assert!(properties.get("datasource").is_some());
        assert!(properties.get("sql").is_some());
        assert!(properties.get("allowDangerous").is_some());
        let required = execute.input_schema["required"].as_array().unwrap();
        assert!(required.contains(&JsonValue::from("sql")));
    }

    #[test]
    fn test_parse_arguments_rejects_non_objects_and_unknown_keys() {
        let err = parse_arguments::<ListTablesInput>(JsonValue::from(5)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);

        let err = parse_arguments::<ListTablesInput>(serde_json::json!({
            "datasource": "main",
            "tabel": "x"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);

        let err = parse_arguments::<ListTablesInput>(JsonValue::Null).unwrap_err();
        assert!(err.to_string().contains("datasource"));
    }
}
