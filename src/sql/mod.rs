//! SQL analysis: dialect descriptors, statement classification and the
//! policy gate in front of the executor.

pub mod classifier;
pub mod dialect;
pub mod hazard;
pub mod policy;

pub use classifier::{ParseError, StatementCategory, StatementClassification, classify};
pub use dialect::SqlDialect;
pub use hazard::Hazard;
pub use policy::{AuthorizedStatement, PolicyContext, authorize, evaluate};
