use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimmerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Infer output type / list-quantifier / options constraints for
    /// ingredient calls from their surrounding predicate context.
    pub infer_gen_constraints: bool,
    /// Upper bound on internal parallelism an ingredient may use when
    /// batching external calls. Passed through, not enforced here.
    pub max_concurrent_ingredient_calls: usize,
    /// When an abstracted (column/predicate-pushed) select fails against the
    /// backend, degrade to selecting the whole table instead of failing.
    pub fallback_to_full_scan: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            infer_gen_constraints: true,
            max_concurrent_ingredient_calls: 8,
            fallback_to_full_scan: true,
        }
    }
}

impl EngineConfig {
    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        serde_json::from_str(&s).map_err(|e| SimmerError::InvalidConfig(e.to_string()))
    }
}
