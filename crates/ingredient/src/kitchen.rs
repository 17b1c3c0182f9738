//! Per-execution registry binding ingredient names to live instances.

use std::collections::HashMap;
use std::sync::Arc;

use simmer_backend::Database;
use simmer_common::{Result, SimmerError};
use tracing::debug;

use crate::{Ingredient, IngredientFactory, IngredientKind};

/// Owned collection of bound ingredient instances for one top-level
/// execution. Constructed once per call and passed by reference to the
/// orchestrator and all recursive sub-calls.
#[derive(Debug)]
pub struct Kitchen {
    instances: HashMap<String, Box<dyn Ingredient>>,
}

impl Kitchen {
    /// Instantiate every factory exactly once, injecting the database handle
    /// and session id.
    ///
    /// # Errors
    /// `DuplicateIngredient` when two names collide after ASCII-lowercasing.
    pub fn bind(
        factories: &[Arc<dyn IngredientFactory>],
        db: Arc<dyn Database>,
        session_id: &str,
    ) -> Result<Self> {
        let mut instances: HashMap<String, Box<dyn Ingredient>> = HashMap::new();
        for factory in factories {
            let key = factory.name().to_ascii_lowercase();
            if instances.contains_key(&key) {
                return Err(SimmerError::DuplicateIngredient(factory.name().to_string()));
            }
            let instance = factory.build(db.clone(), session_id);
            debug!(name = %factory.name(), kind = instance.kind().as_str(), "ingredient bound");
            instances.insert(key, instance);
        }
        Ok(Self { instances })
    }

    pub fn lookup(&self, name: &str) -> Result<&dyn Ingredient> {
        self.instances
            .get(&name.to_ascii_lowercase())
            .map(|b| b.as_ref())
            .ok_or_else(|| SimmerError::UnknownIngredient(name.to_string()))
    }

    pub fn kind_of(&self, name: &str) -> Result<IngredientKind> {
        Ok(self.lookup(name)?.kind())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Sum of per-instance processed-value counters, for metadata.
    pub fn total_values_processed(&self) -> u64 {
        self.instances.values().map(|i| i.values_processed()).sum()
    }
}
