//! Database layer.
//!
//! - `driver`: the seam to engine drivers (sqlx adapter)
//! - `pool`: per-datasource connection pools and leases
//! - `executor`: statement execution under limits
//! - `schema`: catalog introspection
//! - `types`, `params`: row decoding and parameter binding

pub mod driver;
pub mod executor;
pub(crate) mod params;
pub mod pool;
pub mod schema;
pub mod types;

pub use driver::{Connector, DriverConnection, RowStream, SqlxConnection, SqlxConnector};
pub use executor::{QueryExecutor, settle_lease, with_time_limit};
pub use pool::{Lease, MAX_HEALTH_CHECK_ATTEMPTS, Pool, PoolManager, PoolStats};
pub use schema::SchemaInspector;
