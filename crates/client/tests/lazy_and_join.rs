use std::sync::atomic::Ordering;
use std::sync::Arc;

use simmer_backend::{SqliteBackend, Value};
use simmer_client::Engine;
use simmer_common::EngineConfig;

#[path = "support/mod.rs"]
mod support;

use support::{fixture_db, CiAlignFactory, FixedQaFactory};

#[test]
fn unreferenced_cte_never_materializes_or_invokes_ingredients() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (factory, calls) = FixedQaFactory::new("PickCity", Value::Text("bathurst".into()));
    engine.register_ingredient(factory);

    let env = engine
        .blend(
            "WITH unused AS (SELECT city FROM w WHERE city = {{PickCity('closest to Sydney')}}) \
             SELECT city FROM w ORDER BY city",
        )
        .expect("blend");

    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert_eq!(env.values_passed, 0);
    assert_eq!(env.generation_calls, 0);
    assert_eq!(env.result.num_rows(), 2);
}

#[test]
fn referenced_cte_materializes_through_a_recursive_entry() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (factory, calls) = FixedQaFactory::new("PickCity", Value::Text("bathurst".into()));
    engine.register_ingredient(factory);

    let env = engine
        .blend(
            "WITH picked AS (SELECT date, city FROM w \
             WHERE city = {{PickCity('closest to Sydney', options='w::city')}}) \
             SELECT date FROM picked",
        )
        .expect("blend");

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(env.result.num_rows(), 1);
    assert_eq!(
        env.result.column_values("date").unwrap(),
        vec![Value::Text("11 jun".into())]
    );
    // Nested work is attributed to the outermost statement.
    assert_eq!(env.values_passed, 2);
}

#[test]
fn plain_cte_still_resolves_without_ingredients_inside() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (factory, _) = FixedQaFactory::new("PickCity", Value::Text("11 jun".into()));
    engine.register_ingredient(factory);

    let env = engine
        .blend(
            "WITH dates AS (SELECT date FROM w) \
             SELECT date FROM dates WHERE date = {{PickCity('first of the month')}}",
        )
        .expect("blend");
    assert_eq!(env.result.num_rows(), 1);
}

fn join_fixture() -> Arc<SqliteBackend> {
    let db = SqliteBackend::open_in_memory().expect("backend");
    db.execute_batch(
        "CREATE TABLE fruits (fruit TEXT);
         CREATE TABLE colors (name TEXT, shade TEXT);
         INSERT INTO fruits VALUES ('Apple');
         INSERT INTO fruits VALUES ('Plum');
         INSERT INTO colors VALUES ('apple', 'red');
         INSERT INTO colors VALUES ('plum', 'purple');
         INSERT INTO colors VALUES ('sloe', 'blue');",
    )
    .expect("fixture");
    Arc::new(db)
}

#[test]
fn join_ingredient_rewrites_the_on_predicate() {
    let db = join_fixture();
    let mut engine = Engine::new(db, EngineConfig::default());
    engine.register_ingredient(Arc::new(CiAlignFactory {
        name: "Align".to_string(),
    }));

    let env = engine
        .blend(
            "SELECT fruits.fruit, colors.shade FROM fruits \
             JOIN colors ON {{Align(fruits.fruit, colors.name)}} ORDER BY fruits.fruit",
        )
        .expect("blend");

    assert_eq!(env.result.num_rows(), 2);
    assert_eq!(
        env.result.column_values("shade").unwrap(),
        vec![Value::Text("red".into()), Value::Text("purple".into())]
    );
    // Both sides' distinct values were routed to the aligner.
    assert_eq!(env.values_passed, 5);
}

#[test]
fn join_ingredient_with_no_matches_yields_empty_result() {
    let db = join_fixture();
    let mut engine = Engine::new(db.clone(), EngineConfig::default());
    db.execute_batch("DELETE FROM colors").expect("empty side");
    engine.register_ingredient(Arc::new(CiAlignFactory {
        name: "Align".to_string(),
    }));

    let env = engine
        .blend(
            "SELECT fruits.fruit FROM fruits \
             JOIN colors ON {{Align(fruits.fruit, colors.name)}}",
        )
        .expect("blend");
    assert_eq!(env.result.num_rows(), 0);
}
