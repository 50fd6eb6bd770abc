//! Tool handlers and the registry that dispatches to them.
//!
//! - `registry`: tool catalogue, argument validation, dispatch
//! - `schema`: `listDatasources`, `listTables`, `describeTable`
//! - `query`: `executeQuery`
//! - `explain`: `explainQuery`
//! - `parse`: `parseSql`
//! - `format`: text rendering of result rows

pub mod explain;
pub mod format;
pub mod parse;
pub mod query;
pub mod registry;
pub mod schema;

pub use explain::{ExplainOutput, ExplainQueryInput};
pub use format::OutputFormat;
pub use parse::{ParseSqlInput, ParseSqlOutput};
pub use query::{ExecuteQueryInput, QueryOutput};
pub use registry::{ToolDescriptor, ToolKind, ToolRegistry};
pub use schema::{DescribeTableInput, ListDatasourcesInput, ListTablesInput};
