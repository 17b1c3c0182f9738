//! Ingredient contract and the per-execution kitchen registry.
//!
//! An ingredient is an external, non-SQL operation embedded in a hybrid
//! query. Every implementation exposes a stable name, a closed kind tag, and
//! one computation entry point receiving resolved arguments plus injected
//! helpers, returning a kind-tagged result the orchestrator splices back
//! into the statement.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use simmer_backend::{temp, Database, Relation, Value};
use simmer_common::{Result, UsageCounters, UsageRegistry};

pub mod constraints;
pub mod kitchen;

pub use constraints::{GenConstraints, OptionsSpec, OutputType};
pub use kitchen::Kitchen;

/// Closed set of ingredient kinds.
///
/// Kept as a tagged enum rather than open subtyping so the orchestrator's
/// fixed priority ordering stays exhaustive and compiler-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngredientKind {
    /// Pure text substitution with no data dependency.
    String,
    /// Row-wise operation adding one new column per distinct input value.
    Map,
    /// Produces a two-column alignment table rewriting a `JOIN ... ON`.
    Join,
    /// Reduces a (sub)relation to a literal, spliced in place.
    Qa,
    /// Resolves to a table name spliced as a bare identifier.
    Alias,
}

impl IngredientKind {
    /// Fixed execution priority within one subquery unit; lower runs first.
    ///
    /// String/Alias substitutions carry no data dependency; Map adds columns
    /// QA may read; Join consumes whatever earlier steps resolved.
    pub fn priority(self) -> u8 {
        match self {
            IngredientKind::String | IngredientKind::Alias => 0,
            IngredientKind::Map => 1,
            IngredientKind::Qa => 2,
            IngredientKind::Join => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IngredientKind::String => "string",
            IngredientKind::Map => "map",
            IngredientKind::Join => "join",
            IngredientKind::Qa => "qa",
            IngredientKind::Alias => "alias",
        }
    }
}

/// A `table.column` argument resolved against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnTarget {
    pub table: String,
    pub column: String,
}

/// Resolved arguments for one invocation.
///
/// Which fields are populated depends on the kind: Map gets `target` +
/// `values`; Join gets both targets and both value lists; QA gets
/// `context`/`options`; String gets the question alone.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub question: Option<&'a str>,
    pub target: Option<&'a ColumnTarget>,
    pub right_target: Option<&'a ColumnTarget>,
    /// Distinct values routed to the call (Map: unseen values of the target
    /// column; Join: left-side values).
    pub values: &'a [Value],
    /// Join only: right-side values.
    pub right_values: &'a [Value],
    pub context: Option<&'a Relation>,
    pub options: Option<&'a [Value]>,
    pub constraints: &'a GenConstraints,
}

/// Helpers injected into every invocation.
pub struct InvocationCtx<'a> {
    pub db: &'a dyn Database,
    pub session_id: &'a str,
    pub unit_index: usize,
    /// Base table -> current session-scoped temp revision.
    pub table_revisions: &'a BTreeMap<String, String>,
    /// Columns added to revisions by earlier Map invocations.
    pub prior_columns: &'a BTreeSet<String>,
    pub usage: &'a UsageCounters,
    pub metrics: &'a UsageRegistry,
    /// Internal parallelism bound for batched external calls; passed
    /// through from configuration, not enforced by the orchestrator.
    pub concurrency_limit: usize,
}

impl<'a> InvocationCtx<'a> {
    /// Report model token usage for this invocation; rolled into the result
    /// envelope and the process-wide metrics.
    pub fn add_tokens(&self, ingredient: &str, prompt: u64, completion: u64) {
        self.usage.add_tokens(prompt, completion);
        self.metrics.record_tokens(ingredient, prompt, completion);
    }

    /// Subquery-scoped temp name for `base` in the current unit.
    pub fn subquery_temp_name(&self, base: &str) -> String {
        temp::subquery_scoped(self.session_id, self.unit_index, base)
    }

    /// Session-scoped temp revision name for `base`.
    pub fn session_temp_name(&self, base: &str) -> String {
        temp::session_scoped(self.session_id, base)
    }

    /// The relation name current reads of `base` should go through.
    pub fn current_table<'b>(&'b self, base: &'b str) -> &'b str {
        self.table_revisions.get(base).map(String::as_str).unwrap_or(base)
    }
}

/// Kind-tagged invocation result.
#[derive(Debug, Clone, PartialEq)]
pub enum IngredientOutput {
    /// String/QA: a literal spliced (escaped) in place of the alias.
    Literal(Value),
    /// QA with a list quantifier: values spliced as a membership list.
    LiteralList(Vec<Value>),
    /// Alias: a table name spliced as a bare identifier.
    TableRef(String),
    /// Map: the merged relation becomes the new session-scoped revision of
    /// `table`; the alias resolves to a `table.column` reference.
    MappedColumn {
        column: String,
        table: String,
        source_column: String,
        relation: Relation,
    },
    /// Join: `table` names a two-column alignment relation (columns `lhs`,
    /// `rhs`) already written through the invocation context's db handle.
    Alignment {
        left_table: String,
        right_table: String,
        join_clause: String,
        table: String,
    },
}

/// Runtime ingredient contract.
pub trait Ingredient: Send + Sync {
    /// Stable name used in hybrid queries (`{{ PickCity(...) }}`).
    fn name(&self) -> &str;

    fn kind(&self) -> IngredientKind;

    /// Pure computation entry point.
    ///
    /// # Errors
    /// Implementations return `SimmerError::Ingredient` for their own
    /// contract failures (empty required context, malformed model output).
    fn invoke(&self, call: &Invocation<'_>, ctx: &InvocationCtx<'_>) -> Result<IngredientOutput>;

    /// Monotonic count of values this instance has processed, for metadata.
    fn values_processed(&self) -> u64 {
        0
    }
}

impl std::fmt::Debug for dyn Ingredient + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingredient")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Builds one ingredient instance per top-level execution.
pub trait IngredientFactory: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, db: Arc<dyn Database>, session_id: &str) -> Box<dyn Ingredient>;
}
