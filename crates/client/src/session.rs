use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use simmer_backend::Database;
use simmer_common::{EngineConfig, Result, SessionId, UsageCounters, UsageRegistry};
use simmer_ingredient::{IngredientFactory, Kitchen};

/// One top-level execution and its temp-table namespace.
///
/// The session owns the bound kitchen and the database handle for the
/// duration of the call; nested recursive invocations share it by reference,
/// which is how their temp tables and usage counters stay attributed to the
/// outermost statement.
pub struct Session {
    pub config: EngineConfig,
    pub db: Arc<dyn Database>,
    pub id: SessionId,
    pub kitchen: Kitchen,
    pub usage: UsageCounters,
    pub metrics: UsageRegistry,
    unit_counter: AtomicUsize,
}

impl Session {
    pub fn new(
        config: EngineConfig,
        db: Arc<dyn Database>,
        factories: &[Arc<dyn IngredientFactory>],
        metrics: UsageRegistry,
    ) -> Result<Self> {
        let id = SessionId::fresh();
        let kitchen = Kitchen::bind(factories, db.clone(), id.as_str())?;
        Ok(Self {
            config,
            db,
            id,
            kitchen,
            usage: UsageCounters::new(),
            metrics,
            unit_counter: AtomicUsize::new(0),
        })
    }

    /// Session-unique subquery index; shared with nested recursive calls so
    /// their temp-table names never collide with the parent's.
    pub fn next_unit_index(&self) -> usize {
        self.unit_counter.fetch_add(1, Ordering::Relaxed)
    }
}
