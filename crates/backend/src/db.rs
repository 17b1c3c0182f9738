use simmer_common::Result;

use crate::relation::{Relation, SchemaMap, Value};

/// Relational backend capability set consumed by the engine.
///
/// Implementations are driver-specific; the engine only ever sees this seam.
/// One top-level execution owns the connection exclusively; temp relations
/// written here live until [`Database::reset_session`].
pub trait Database: Send + Sync {
    /// Run a statement and collect its full result set.
    fn execute_to_relation(&self, sql: &str) -> Result<Relation>;

    /// Run a statement expected to produce a single column; flatten it.
    fn execute_to_scalar_list(&self, sql: &str) -> Result<Vec<Value>>;

    /// Write a relation as a session temp table under `name`, replacing any
    /// prior temp relation of that name.
    fn write_temp_relation(&self, relation: &Relation, name: &str) -> Result<()>;

    /// True when a session temp relation named `name` exists.
    fn has_temp_relation(&self, name: &str) -> bool;

    /// Table/column/type map for all base tables.
    fn schema(&self) -> Result<SchemaMap>;

    /// Drop every temp relation created during this session.
    fn reset_session(&self) -> Result<()>;
}
