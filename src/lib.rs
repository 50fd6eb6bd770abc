//! DB Tool Server Library
//!
//! A tool-protocol server that lets agents list, describe, query and explain
//! SQL databases (SQLite, PostgreSQL, MySQL) under a per-datasource safety
//! policy, without ever seeing credentials.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod session;
pub mod sql;
pub mod tools;
pub mod transport;

pub use config::{Cli, ServerConfig};
pub use error::{DbError, DbResult};
pub use protocol::{ProtocolServer, ServerSettings};
pub use session::SessionState;
