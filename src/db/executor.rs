//! Query execution engine.
//!
//! Runs one [`AuthorizedStatement`] on one leased connection and enforces the
//! caller's limits independently of the driver:
//! - row cap: the stream is read one row past the cap so truncation can be
//!   reported instead of silently returning partial data
//! - payload cap: serialized row size is summed as rows arrive
//! - execution time: one deadline covers submission and every row fetch
//!
//! The executor owns the lease for the duration of the call and always ends it:
//! released on success and on query-level errors, invalidated after a
//! connection-level error or a timeout, since the statement may still be
//! running on that session.

use crate::db::driver::{Connector, DriverConnection};
use crate::db::params::describe_params;
use crate::db::pool::Lease;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, DbRow, QueryParam, ResolvedLimits, ResultSet, TruncationReason};
use crate::sql::AuthorizedStatement;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout_at;
use tracing::{debug, warn};

/// Query executor that handles statement execution on leased connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExecutor {
    defaults: ResolvedLimits,
}

impl QueryExecutor {
    pub fn new(defaults: ResolvedLimits) -> Self {
        Self { defaults }
    }

    /// Server-wide limits that caller-supplied limits are resolved against.
    pub fn defaults(&self) -> &ResolvedLimits {
        &self.defaults
    }

    /// Execute an authorized statement and end the lease.
    pub async fn execute<C: Connector>(
        &self,
        statement: &AuthorizedStatement,
        mut lease: Lease<C>,
        params: &[QueryParam],
        limits: ResolvedLimits,
    ) -> DbResult<ResultSet> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + limits.max_execution_time;

        debug!(
            datasource = %lease.datasource(),
            lease_id = lease.lease_id(),
            sql = %statement.sql(),
            params = %describe_params(params),
            max_rows = limits.max_rows,
            timeout_ms = limits.max_execution_time.as_millis() as u64,
            "Executing statement"
        );

        let outcome = if statement.returns_rows() {
            let stream = lease.connection().fetch(statement.sql(), params);
            collect_rows(stream, &limits, deadline)
                .await
                .map(|collected| collected.into_result_set(elapsed_ms(start)))
        } else {
            execute_write(lease.connection(), statement.sql(), params, &limits, deadline)
                .await
                .map(|affected| ResultSet::affected(affected, elapsed_ms(start)))
        };

        if let Ok(result) = &outcome {
            debug!(
                datasource = %lease.datasource(),
                row_count = result.row_count,
                rows_affected = ?result.rows_affected,
                truncated = result.truncated,
                elapsed_ms = result.execution_time_ms,
                "Statement completed"
            );
        }
        settle_lease(lease, &outcome);
        outcome
    }
}

/// End a lease according to how the work done on it ended.
///
/// Query-level errors leave the session usable. Connection-level errors and
/// timeouts do not: the statement may still be running on it.
pub fn settle_lease<C: Connector, T>(lease: Lease<C>, outcome: &DbResult<T>) {
    match outcome {
        Err(e) if e.is_connection_fatal() || matches!(e, DbError::ExecutionTimeout { .. }) => {
            warn!(
                datasource = %lease.datasource(),
                lease_id = lease.lease_id(),
                error = %e,
                "Statement failed at connection level"
            );
            lease.invalidate();
        }
        Err(e) => {
            debug!(datasource = %lease.datasource(), error = %e, "Statement rejected by engine");
            lease.release();
        }
        Ok(_) => lease.release(),
    }
}

/// Bound metadata work by the same time limit as statements.
pub async fn with_time_limit<F, T>(limit: Duration, work: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(DbError::execution_timeout(limit.as_millis() as u64, 0)),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn limit_ms(limits: &ResolvedLimits) -> u64 {
    limits.max_execution_time.as_millis() as u64
}

async fn execute_write<T: DriverConnection>(
    conn: &mut T,
    sql: &str,
    params: &[QueryParam],
    limits: &ResolvedLimits,
    deadline: tokio::time::Instant,
) -> DbResult<u64> {
    match timeout_at(deadline, conn.execute(sql, params)).await {
        Ok(result) => result,
        Err(_) => Err(DbError::execution_timeout(limit_ms(limits), 0)),
    }
}

/// Rows read from a stream before it ended or a cap was hit.
#[derive(Debug, Default)]
pub(crate) struct CollectedRows {
    columns: Option<Arc<[ColumnMetadata]>>,
    rows: Vec<Map<String, JsonValue>>,
    payload_bytes: usize,
    truncation: Option<TruncationReason>,
}

impl CollectedRows {
    fn into_result_set(self, execution_time_ms: u64) -> ResultSet {
        if let Some(reason) = self.truncation {
            debug!(
                rows = self.rows.len(),
                payload_bytes = self.payload_bytes,
                reason = ?reason,
                "Result truncated"
            );
        }
        ResultSet {
            columns: self.columns.map(|c| c.to_vec()).unwrap_or_default(),
            row_count: self.rows.len(),
            rows: self.rows,
            rows_affected: None,
            truncated: self.truncation.is_some(),
            truncation_reason: self.truncation,
            execution_time_ms,
        }
    }
}

/// Drain `stream` until it ends, a cap is hit or the deadline passes.
///
/// Stops reading as soon as a cap is hit; the rest of the result is never
/// fetched into memory.
pub(crate) async fn collect_rows<S>(
    stream: S,
    limits: &ResolvedLimits,
    deadline: tokio::time::Instant,
) -> DbResult<CollectedRows>
where
    S: Stream<Item = DbResult<DbRow>> + Unpin,
{
    let mut stream = stream;
    let mut collected = CollectedRows::default();
    let max_rows = limits.max_rows as usize;

    loop {
        let next = match timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                return Err(DbError::execution_timeout(
                    limit_ms(limits),
                    collected.rows.len(),
                ));
            }
        };
        let Some(row) = next else {
            break;
        };
        let row = row?;

        if collected.columns.is_none() {
            collected.columns = Some(Arc::clone(&row.columns));
        }
        if collected.rows.len() >= max_rows {
            collected.truncation = Some(TruncationReason::RowLimit);
            break;
        }

        let row = row.into_map();
        let size = serde_json::to_vec(&row)
            .map_err(|e| DbError::internal(format!("Failed to serialize row: {}", e)))?
            .len();
        if collected.payload_bytes + size > limits.max_payload_bytes {
            collected.truncation = Some(TruncationReason::PayloadLimit);
            break;
        }
        collected.payload_bytes += size;
        collected.rows.push(row);
    }

    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn deadline_after(limit: Duration) -> tokio::time::Instant {
        tokio::time::Instant::now() + limit
    }

    fn rows(n: usize) -> Vec<DbResult<DbRow>> {
        let columns: Arc<[ColumnMetadata]> = vec![
            ColumnMetadata::new("id", "INTEGER", false),
            ColumnMetadata::new("label", "TEXT", true),
        ]
        .into();
        (0..n)
            .map(|i| {
                Ok(DbRow::new(
                    Arc::clone(&columns),
                    vec![json!(i), json!(format!("row-{i}"))],
                ))
            })
            .collect()
    }

    fn limits(max_rows: u32, max_payload_bytes: usize) -> ResolvedLimits {
        ResolvedLimits {
            max_rows,
            max_execution_time: Duration::from_secs(5),
            max_payload_bytes,
        }
    }

    #[tokio::test]
    async fn test_row_cap_truncates() {
        let limits = limits(10, 1 << 20);
        let collected = collect_rows(stream::iter(rows(100)), &limits, deadline_after(Duration::from_secs(5)))
            .await
            .unwrap();
        let result = collected.into_result_set(3);
        assert_eq!(result.row_count, 10);
        assert_eq!(result.rows.len(), 10);
        assert!(result.truncated);
        assert_eq!(result.truncation_reason, Some(TruncationReason::RowLimit));
        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.rows[9]["id"], 9);
    }

    #[tokio::test]
    async fn test_exact_row_count_is_not_truncated() {
        let limits = limits(10, 1 << 20);
        let result = collect_rows(stream::iter(rows(10)), &limits, deadline_after(Duration::from_secs(5)))
            .await
            .unwrap()
            .into_result_set(0);
        assert_eq!(result.row_count, 10);
        assert!(!result.truncated);
        assert!(result.truncation_reason.is_none());
    }

    #[tokio::test]
    async fn test_payload_cap_truncates() {
        // Each row serializes to roughly 25 bytes.
        let limits = limits(100, 60);
        let result = collect_rows(stream::iter(rows(10)), &limits, deadline_after(Duration::from_secs(5)))
            .await
            .unwrap()
            .into_result_set(0);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.truncation_reason, Some(TruncationReason::PayloadLimit));
    }

    #[tokio::test]
    async fn test_empty_result() {
        let limits = limits(10, 1 << 20);
        let result = collect_rows(stream::iter(rows(0)), &limits, deadline_after(Duration::from_secs(5)))
            .await
            .unwrap()
            .into_result_set(0);
        assert_eq!(result.row_count, 0);
        assert!(result.columns.is_empty());
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let limits = limits(10, 1 << 20);
        let mut items = rows(2);
        items.push(Err(DbError::query_failed("division by zero", Some("22012".into()), "check")));
        let err = collect_rows(stream::iter(items), &limits, deadline_after(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::QueryFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_partial_rows() {
        let limits = ResolvedLimits {
            max_rows: 10,
            max_execution_time: Duration::from_millis(50),
            max_payload_bytes: 1 << 20,
        };
        let slow = stream::iter(rows(1)).chain(stream::pending());
        let err = collect_rows(Box::pin(slow), &limits, deadline_after(limits.max_execution_time))
            .await
            .unwrap_err();
        match err {
            DbError::ExecutionTimeout {
                limit_ms,
                partial_row_count,
            } => {
                assert_eq!(limit_ms, 50);
                assert_eq!(partial_row_count, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
