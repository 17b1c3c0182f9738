//! Hybrid-query compilation.
//!
//! Architecture role:
//! - [`extract`]: scan raw hybrid text, register de-duplicated ingredient
//!   calls under short aliases, rewrite to parser-clean SQL
//! - [`context`]: per-subquery abstracted table selects and generation
//!   constraint inference
//! - [`lazy`]: take-once registry for deferred derived tables

pub mod context;
pub mod extract;
pub mod lazy;

pub use context::{
    abstracted_table_selects, from_tables, infer_constraints, AbstractedSelect, FromTable,
    SubqueryUnit,
};
pub use extract::{extract, AliasRecord, AliasTable, CallArg};
pub use lazy::{DeferredTable, LazyTableRegistry};
