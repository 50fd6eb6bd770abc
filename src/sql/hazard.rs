//! Destructive-statement detection.
//!
//! Under a read-write policy some statements still need an explicit
//! `allowDangerous` opt-in because they can lose data wholesale: DROP of a
//! table, index, schema or database, TRUNCATE, ALTER TABLE ... DROP COLUMN and
//! DELETE/UPDATE without a WHERE clause. Detection works on the parsed AST so
//! comments and formatting cannot hide the operation.

use schemars::JsonSchema;
use serde::Serialize;
use sqlparser::ast::{AlterTableOperation, ObjectType, Statement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Hazard {
    DropDatabase,
    DropSchema,
    DropTable,
    DropIndex,
    AlterTableDropColumn,
    Truncate,
    DeleteWithoutWhere,
    UpdateWithoutWhere,
}

impl Hazard {
    /// Operation name for error messages.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::DropDatabase => "DROP DATABASE",
            Self::DropSchema => "DROP SCHEMA",
            Self::DropTable => "DROP TABLE",
            Self::DropIndex => "DROP INDEX",
            Self::AlterTableDropColumn => "ALTER TABLE DROP COLUMN",
            Self::Truncate => "TRUNCATE",
            Self::DeleteWithoutWhere => "DELETE without WHERE",
            Self::UpdateWithoutWhere => "UPDATE without WHERE",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::DropDatabase | Self::DropSchema => {
                "This will permanently delete every object in it and all their data"
            }
            Self::DropTable => "This will permanently delete the table and all its data",
            Self::DropIndex => "This will permanently delete the index",
            Self::AlterTableDropColumn => {
                "This will permanently delete the column and all its data"
            }
            Self::Truncate => "This will remove all rows from the table",
            Self::DeleteWithoutWhere => "This will delete all rows from the table",
            Self::UpdateWithoutWhere => "This will update all rows in the table",
        }
    }
}

impl std::fmt::Display for Hazard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.operation_name())
    }
}

/// Inspect one statement, without descending into the statements it contains.
pub fn detect(stmt: &Statement) -> Option<Hazard> {
    match stmt {
        Statement::Drop { object_type, .. } => match object_type {
            ObjectType::Table => Some(Hazard::DropTable),
            ObjectType::Index => Some(Hazard::DropIndex),
            ObjectType::Database => Some(Hazard::DropDatabase),
            ObjectType::Schema => Some(Hazard::DropSchema),
            _ => None,
        },

        Statement::AlterTable(alter_table) => alter_table
            .operations
            .iter()
            .any(|op| matches!(op, AlterTableOperation::DropColumn { .. }))
            .then_some(Hazard::AlterTableDropColumn),

        Statement::Truncate { .. } => Some(Hazard::Truncate),

        Statement::Delete(delete) => delete
            .selection
            .is_none()
            .then_some(Hazard::DeleteWithoutWhere),

        Statement::Update(update) => update
            .selection
            .is_none()
            .then_some(Hazard::UpdateWithoutWhere),

        _ => None,
    }
}
