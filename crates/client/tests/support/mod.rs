//! Deterministic stub ingredients and fixtures shared by integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use simmer_backend::{Database, Relation, SqliteBackend, Value};
use simmer_common::{Result, SimmerError};
use simmer_ingredient::{
    Ingredient, IngredientFactory, IngredientKind, IngredientOutput, Invocation, InvocationCtx,
};

/// Per-factory invocation counter shared with every built instance.
pub type Calls = Arc<AtomicU64>;

pub fn fixture_db() -> Arc<SqliteBackend> {
    let db = SqliteBackend::open_in_memory().expect("backend");
    db.execute_batch(
        "CREATE TABLE w (date TEXT, rival TEXT, city TEXT);
         INSERT INTO w VALUES ('11 jun', 'western districts', 'bathurst');
         INSERT INTO w VALUES ('5 jun', 'northern districts', 'newcastle');",
    )
    .expect("fixture");
    Arc::new(db)
}

// ---------------------------------------------------------------------------
// QA stub: returns a fixed literal
// ---------------------------------------------------------------------------

pub struct FixedQa {
    name: String,
    answer: Value,
    calls: Calls,
}

impl Ingredient for FixedQa {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> IngredientKind {
        IngredientKind::Qa
    }
    fn invoke(&self, call: &Invocation<'_>, ctx: &InvocationCtx<'_>) -> Result<IngredientOutput> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let prompt = call
            .question
            .map(|q| q.split_whitespace().count() as u64)
            .unwrap_or(0);
        ctx.add_tokens(&self.name, prompt, 1);
        Ok(IngredientOutput::Literal(self.answer.clone()))
    }
}

pub struct FixedQaFactory {
    pub name: String,
    pub answer: Value,
    pub calls: Calls,
}

impl FixedQaFactory {
    pub fn new(name: &str, answer: Value) -> (Arc<Self>, Calls) {
        let calls = Calls::default();
        (
            Arc::new(Self {
                name: name.to_string(),
                answer,
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

impl IngredientFactory for FixedQaFactory {
    fn name(&self) -> &str {
        &self.name
    }
    fn build(&self, _db: Arc<dyn Database>, _session_id: &str) -> Box<dyn Ingredient> {
        Box::new(FixedQa {
            name: self.name.clone(),
            answer: self.answer.clone(),
            calls: self.calls.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// QA stub: returns a fixed value list
// ---------------------------------------------------------------------------

pub struct ListQaFactory {
    pub name: String,
    pub answers: Vec<Value>,
}

struct ListQa {
    name: String,
    answers: Vec<Value>,
}

impl Ingredient for ListQa {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> IngredientKind {
        IngredientKind::Qa
    }
    fn invoke(&self, _call: &Invocation<'_>, _ctx: &InvocationCtx<'_>) -> Result<IngredientOutput> {
        Ok(IngredientOutput::LiteralList(self.answers.clone()))
    }
}

impl IngredientFactory for ListQaFactory {
    fn name(&self) -> &str {
        &self.name
    }
    fn build(&self, _db: Arc<dyn Database>, _session_id: &str) -> Box<dyn Ingredient> {
        Box::new(ListQa {
            name: self.name.clone(),
            answers: self.answers.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// QA stub: records the context it receives, answers from a column
// ---------------------------------------------------------------------------

pub type SeenColumns = Arc<Mutex<Vec<String>>>;

pub struct InspectQaFactory {
    pub name: String,
    pub answer: Value,
    pub seen: SeenColumns,
}

impl InspectQaFactory {
    pub fn new(name: &str, answer: Value) -> (Arc<Self>, SeenColumns) {
        let seen = SeenColumns::default();
        (
            Arc::new(Self {
                name: name.to_string(),
                answer,
                seen: seen.clone(),
            }),
            seen,
        )
    }
}

struct InspectQa {
    name: String,
    answer: Value,
    seen: SeenColumns,
}

impl Ingredient for InspectQa {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> IngredientKind {
        IngredientKind::Qa
    }
    fn invoke(&self, call: &Invocation<'_>, _ctx: &InvocationCtx<'_>) -> Result<IngredientOutput> {
        if let Some(context) = call.context {
            let mut seen = self.seen.lock().expect("seen lock poisoned");
            *seen = context.columns().to_vec();
        }
        Ok(IngredientOutput::Literal(self.answer.clone()))
    }
}

impl IngredientFactory for InspectQaFactory {
    fn name(&self) -> &str {
        &self.name
    }
    fn build(&self, _db: Arc<dyn Database>, _session_id: &str) -> Box<dyn Ingredient> {
        Box::new(InspectQa {
            name: self.name.clone(),
            answer: self.answer.clone(),
            seen: self.seen.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Map stub: deterministic value -> value mapping, contract-conforming merge
// ---------------------------------------------------------------------------

pub struct TableMapFactory {
    pub name: String,
    pub mapping: HashMap<String, Value>,
    pub calls: Calls,
}

impl TableMapFactory {
    pub fn new(name: &str, pairs: &[(&str, &str)]) -> (Arc<Self>, Calls) {
        let calls = Calls::default();
        let mapping = pairs
            .iter()
            .map(|(k, v)| {
                (
                    Value::Text((*k).to_string()).merge_key(),
                    Value::Text((*v).to_string()),
                )
            })
            .collect();
        (
            Arc::new(Self {
                name: name.to_string(),
                mapping,
                calls: calls.clone(),
            }),
            calls,
        )
    }
}

struct TableMap {
    name: String,
    mapping: HashMap<String, Value>,
    calls: Calls,
    processed: AtomicU64,
}

impl Ingredient for TableMap {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> IngredientKind {
        IngredientKind::Map
    }
    fn invoke(&self, call: &Invocation<'_>, _ctx: &InvocationCtx<'_>) -> Result<IngredientOutput> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let target = call
            .target
            .ok_or_else(|| SimmerError::Ingredient("map call without target".to_string()))?;
        let base = call
            .context
            .ok_or_else(|| SimmerError::Ingredient("map call without base relation".to_string()))?;
        let new_column = format!("{}_{}", self.name.to_ascii_lowercase(), target.column);
        let mut mapping = HashMap::new();
        for v in call.values {
            self.processed.fetch_add(1, Ordering::Relaxed);
            mapping.insert(
                v.merge_key(),
                self.mapping.get(&v.merge_key()).cloned().unwrap_or(Value::Null),
            );
        }
        let merged = base.merge_mapped_column(&target.column, &new_column, &mapping)?;
        Ok(IngredientOutput::MappedColumn {
            column: new_column,
            table: target.table.clone(),
            source_column: target.column.clone(),
            relation: merged,
        })
    }
    fn values_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl IngredientFactory for TableMapFactory {
    fn name(&self) -> &str {
        &self.name
    }
    fn build(&self, _db: Arc<dyn Database>, _session_id: &str) -> Box<dyn Ingredient> {
        Box::new(TableMap {
            name: self.name.clone(),
            mapping: self.mapping.clone(),
            calls: self.calls.clone(),
            processed: AtomicU64::new(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Map stub that violates the row-count contract
// ---------------------------------------------------------------------------

pub struct BrokenMapFactory {
    pub name: String,
}

struct BrokenMap {
    name: String,
}

impl Ingredient for BrokenMap {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> IngredientKind {
        IngredientKind::Map
    }
    fn invoke(&self, call: &Invocation<'_>, _ctx: &InvocationCtx<'_>) -> Result<IngredientOutput> {
        let target = call
            .target
            .ok_or_else(|| SimmerError::Ingredient("map call without target".to_string()))?;
        // 1:n output: one spurious extra row.
        let relation = Relation::with_rows(
            vec![target.column.clone(), "extra".to_string()],
            vec![
                vec![Value::Text("a".into()), Value::Text("x".into())],
                vec![Value::Text("a".into()), Value::Text("y".into())],
                vec![Value::Text("b".into()), Value::Text("z".into())],
            ],
        )?;
        Ok(IngredientOutput::MappedColumn {
            column: "extra".to_string(),
            table: target.table.clone(),
            source_column: target.column.clone(),
            relation,
        })
    }
}

impl IngredientFactory for BrokenMapFactory {
    fn name(&self) -> &str {
        &self.name
    }
    fn build(&self, _db: Arc<dyn Database>, _session_id: &str) -> Box<dyn Ingredient> {
        Box::new(BrokenMap {
            name: self.name.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Join stub: case-insensitive equality alignment
// ---------------------------------------------------------------------------

pub struct CiAlignFactory {
    pub name: String,
}

struct CiAlign {
    name: String,
    db: Arc<dyn Database>,
}

impl Ingredient for CiAlign {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> IngredientKind {
        IngredientKind::Join
    }
    fn invoke(&self, call: &Invocation<'_>, ctx: &InvocationCtx<'_>) -> Result<IngredientOutput> {
        let left = call
            .target
            .ok_or_else(|| SimmerError::Ingredient("join call without left target".to_string()))?;
        let right = call
            .right_target
            .ok_or_else(|| SimmerError::Ingredient("join call without right target".to_string()))?;
        let mut rows = Vec::new();
        for l in call.values {
            for r in call.right_values {
                let matched = match (l, r) {
                    (Value::Text(a), Value::Text(b)) => a.eq_ignore_ascii_case(b),
                    (a, b) => a == b,
                };
                if matched {
                    rows.push(vec![l.clone(), r.clone()]);
                }
            }
        }
        let relation = Relation::with_rows(vec!["lhs".to_string(), "rhs".to_string()], rows)?;
        let table = ctx.subquery_temp_name("align");
        self.db.write_temp_relation(&relation, &table)?;
        Ok(IngredientOutput::Alignment {
            left_table: left.table.clone(),
            right_table: right.table.clone(),
            join_clause: call.question.unwrap_or_default().to_string(),
            table,
        })
    }
}

impl IngredientFactory for CiAlignFactory {
    fn name(&self) -> &str {
        &self.name
    }
    fn build(&self, db: Arc<dyn Database>, _session_id: &str) -> Box<dyn Ingredient> {
        Box::new(CiAlign {
            name: self.name.clone(),
            db,
        })
    }
}

// ---------------------------------------------------------------------------
// String stub: echoes its question
// ---------------------------------------------------------------------------

pub struct EchoFactory {
    pub name: String,
}

struct Echo {
    name: String,
}

impl Ingredient for Echo {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> IngredientKind {
        IngredientKind::String
    }
    fn invoke(&self, call: &Invocation<'_>, _ctx: &InvocationCtx<'_>) -> Result<IngredientOutput> {
        Ok(IngredientOutput::Literal(Value::Text(
            call.question.unwrap_or_default().to_string(),
        )))
    }
}

impl IngredientFactory for EchoFactory {
    fn name(&self) -> &str {
        &self.name
    }
    fn build(&self, _db: Arc<dyn Database>, _session_id: &str) -> Box<dyn Ingredient> {
        Box::new(Echo {
            name: self.name.clone(),
        })
    }
}
