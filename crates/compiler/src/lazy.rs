//! Deferred derived tables.
//!
//! CTE bodies and aliased derived subqueries are never executed eagerly.
//! They are registered here and handed out exactly once, on the first
//! downstream dereference of the name; a name the final spliced statement
//! never touches costs zero backend executions and zero ingredient calls.

use std::collections::HashMap;

use tracing::debug;

/// A deferred derived-table computation.
///
/// The body is carried as hybrid SQL text: collection routes it back through
/// the engine when it still contains ingredient calls, or straight to the
/// backend when it does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredTable {
    pub name: String,
    pub body_sql: String,
    pub has_ingredient_call: bool,
}

#[derive(Debug)]
enum LazyState {
    Pending(DeferredTable),
    Collected,
}

/// Single-owner registry with take-once collection semantics.
#[derive(Debug, Default)]
pub struct LazyTableRegistry {
    entries: HashMap<String, LazyState>,
}

impl LazyTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, body_sql: String, has_ingredient_call: bool) {
        let name = name.into();
        debug!(name = %name, has_ingredient_call, "lazy table registered");
        self.entries.insert(
            name.clone(),
            LazyState::Pending(DeferredTable {
                name,
                body_sql,
                has_ingredient_call,
            }),
        );
    }

    /// Take the deferred computation for `name`.
    ///
    /// Returns it exactly once; a second collect, or a collect of a name
    /// that was never registered, is a no-op returning `None` (the name is
    /// assumed already materialized).
    pub fn collect(&mut self, name: &str) -> Option<DeferredTable> {
        match self.entries.get_mut(name) {
            Some(state @ LazyState::Pending(_)) => {
                let LazyState::Pending(table) = std::mem::replace(state, LazyState::Collected)
                else {
                    unreachable!("state checked above");
                };
                debug!(name, "lazy table collected");
                Some(table)
            }
            _ => None,
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        matches!(self.entries.get(name), Some(LazyState::Pending(_)))
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, s)| matches!(s, LazyState::Pending(_)))
            .map(|(n, _)| n.clone())
            .collect()
    }
}
