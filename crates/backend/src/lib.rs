//! Relation model and relational backend drivers.
//!
//! Architecture role:
//! - defines the [`Relation`]/[`Value`] exchange format between SQL results
//!   and ingredient invocations
//! - provides the [`Database`] capability seam the engine executes against
//! - ships a SQLite driver; other drivers implement the same trait
//!
//! Key modules:
//! - [`relation`]
//! - [`db`]
//! - [`sqlite`]
//! - [`temp`] (session temp-table naming)

pub mod db;
pub mod relation;
pub mod sqlite;
pub mod temp;

pub use db::Database;
pub use relation::{ColumnType, Relation, SchemaMap, Value};
pub use sqlite::SqliteBackend;
