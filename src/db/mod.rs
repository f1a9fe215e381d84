//! Database module for tenant MySQL schemas
//!
//! Catalog reflection, per-attempt connections, read-only execution and the
//! audit trail.

pub mod audit;
pub mod catalog;
pub mod connection;
pub mod executor;

pub use audit::SqlAuditSink;
pub use catalog::{reflect_catalog, ColumnInfo, ForeignKey, SchemaCatalog, TableInfo};
pub use connection::{MySqlConnector, SchemaConnection, SchemaConnector};
pub use executor::QueryOutput;
