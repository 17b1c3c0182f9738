use std::sync::Arc;

use simmer_backend::Database;
use simmer_common::{EngineConfig, Result, UsageRegistry};
use simmer_ingredient::IngredientFactory;

use crate::envelope::ResultEnvelope;
use crate::orchestrator::Orchestrator;
use crate::session::Session;

/// Public entry point: owns the database handle, the registered ingredient
/// factories, and the process-wide metrics registry.
///
/// Each [`Engine::blend`] call binds a fresh kitchen and session; sessions
/// never share temp-table namespaces or usage counters.
pub struct Engine {
    db: Arc<dyn Database>,
    config: EngineConfig,
    factories: Vec<Arc<dyn IngredientFactory>>,
    metrics: UsageRegistry,
}

impl Engine {
    pub fn new(db: Arc<dyn Database>, config: EngineConfig) -> Self {
        Self {
            db,
            config,
            factories: Vec::new(),
            metrics: UsageRegistry::new(),
        }
    }

    /// Register an ingredient factory. Name collisions surface at blend
    /// time, when the kitchen binds.
    pub fn register_ingredient(&mut self, factory: Arc<dyn IngredientFactory>) {
        self.factories.push(factory);
    }

    /// Compile and execute one hybrid query.
    pub fn blend(&self, query: &str) -> Result<ResultEnvelope> {
        let session = Session::new(
            self.config.clone(),
            self.db.clone(),
            &self.factories,
            self.metrics.clone(),
        )?;
        Orchestrator::outermost(&session).run(query)
    }

    pub fn prometheus_metrics(&self) -> String {
        self.metrics.export_text()
    }
}
