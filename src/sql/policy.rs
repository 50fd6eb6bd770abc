//! Policy gate between classification and execution.
//!
//! The executor only accepts an [`AuthorizedStatement`], and the only way to
//! build one is [`authorize`]. A classification the policy rejects therefore
//! cannot reach a connection.

use super::classifier::{StatementCategory, StatementClassification};
use crate::error::{DbError, DbResult};
use crate::models::AccessPolicy;

/// Denial messages per category.
mod reasons {
    pub const UNSUPPORTED: &str = "Statement type is not supported by this server.";
    pub const READ_ONLY_MUTATE: &str =
        "Datasource is read-only. INSERT/UPDATE/DELETE require a read-write datasource.";
    pub const READ_ONLY_DDL: &str =
        "Datasource is read-only. Schema changes require a read-write datasource.";
    pub const DANGEROUS: &str = "Set allowDangerous to true to run it.";
}

/// Inputs the policy decision depends on besides the statement itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyContext {
    pub policy: AccessPolicy,
    pub allow_dangerous: bool,
}

impl PolicyContext {
    pub fn new(policy: AccessPolicy, allow_dangerous: bool) -> Self {
        Self {
            policy,
            allow_dangerous,
        }
    }
}

/// SQL that passed the policy check, ready for the executor.
#[derive(Debug, Clone)]
pub struct AuthorizedStatement {
    sql: String,
    classification: StatementClassification,
    returns_rows: bool,
}

impl AuthorizedStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn classification(&self) -> &StatementClassification {
        &self.classification
    }

    pub fn is_read(&self) -> bool {
        self.classification.category == StatementCategory::Read
    }

    /// Whether the executor should fetch rows rather than count affected rows.
    pub fn returns_rows(&self) -> bool {
        self.returns_rows
    }

    /// Derive a row-returning statement that wraps this one, e.g. its EXPLAIN.
    ///
    /// The classification is kept so policy decisions about the wrapped
    /// statement still apply.
    pub fn rewrite(&self, sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            classification: self.classification.clone(),
            returns_rows: true,
        }
    }
}

/// Check a classification against the policy without consuming it.
///
/// `Err` carries the denial; the operation name is the statement kind.
pub fn check(classification: &StatementClassification, ctx: PolicyContext) -> DbResult<()> {
    let operation = || classification.statement_kind.clone();

    match classification.category {
        StatementCategory::Unsupported => {
            let reason = match &classification.note {
                Some(note) => format!("{} {}", note, reasons::UNSUPPORTED),
                None => reasons::UNSUPPORTED.to_string(),
            };
            return Err(DbError::policy_denied(operation(), reason));
        }
        StatementCategory::Mutate if ctx.policy.is_read_only() => {
            return Err(DbError::policy_denied(operation(), reasons::READ_ONLY_MUTATE));
        }
        StatementCategory::Ddl if ctx.policy.is_read_only() => {
            return Err(DbError::policy_denied(operation(), reasons::READ_ONLY_DDL));
        }
        _ => {}
    }

    if let Some(hazard) = classification.hazard {
        if !ctx.allow_dangerous {
            return Err(DbError::policy_denied(
                hazard.operation_name(),
                format!("{}. {}", hazard.reason(), reasons::DANGEROUS),
            ));
        }
    }

    Ok(())
}

/// Fill in `allowed` for reporting (parseSql).
pub fn evaluate(
    mut classification: StatementClassification,
    ctx: PolicyContext,
) -> StatementClassification {
    classification.allowed = check(&classification, ctx).is_ok();
    classification
}

/// Gate `sql` for execution.
pub fn authorize(
    sql: impl Into<String>,
    mut classification: StatementClassification,
    ctx: PolicyContext,
) -> DbResult<AuthorizedStatement> {
    check(&classification, ctx)?;
    classification.allowed = true;
    Ok(AuthorizedStatement {
        sql: sql.into(),
        returns_rows: classification.returns_rows,
        classification,
    })
}
