use std::sync::atomic::Ordering;
use std::sync::Arc;

use simmer_backend::Value;
use simmer_client::Engine;
use simmer_common::{EngineConfig, SimmerError};

#[path = "support/mod.rs"]
mod support;

use support::{fixture_db, BrokenMapFactory, InspectQaFactory, ListQaFactory, TableMapFactory};

fn state_mapper() -> (Arc<TableMapFactory>, support::Calls) {
    TableMapFactory::new("State", &[("bathurst", "NSW"), ("newcastle", "NSW")])
}

#[test]
fn map_ingredient_adds_a_column() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (mapper, calls) = state_mapper();
    engine.register_ingredient(mapper);

    let env = engine
        .blend("SELECT city, {{State('state of', w.city)}} FROM w ORDER BY city")
        .expect("blend");

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(env.result.num_rows(), 2);
    // Two distinct city values routed to the mapper.
    assert_eq!(env.values_passed, 2);
    let mapped = env.result.column_values("state_city").expect("mapped column");
    assert_eq!(
        mapped,
        vec![Value::Text("NSW".into()), Value::Text("NSW".into())]
    );
}

#[test]
fn map_output_feeds_a_predicate() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (mapper, _) = TableMapFactory::new("State", &[("bathurst", "NSW"), ("newcastle", "QLD")]);
    engine.register_ingredient(mapper);

    let env = engine
        .blend("SELECT city FROM w WHERE {{State('state of', w.city)}} = 'NSW'")
        .expect("blend");
    assert_eq!(env.result.num_rows(), 1);
    assert_eq!(
        env.result.column_values("city").unwrap(),
        vec![Value::Text("bathurst".into())]
    );
}

#[test]
fn map_row_count_violation_is_fatal() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    engine.register_ingredient(Arc::new(BrokenMapFactory {
        name: "Broken".to_string(),
    }));

    let err = engine
        .blend("SELECT city, {{Broken('anything', w.city)}} FROM w")
        .expect_err("row-count violation");
    assert!(matches!(err, SimmerError::Ingredient(_)), "got {err}");
    assert!(err.to_string().contains("rows"), "got {err}");
}

#[test]
fn map_result_is_visible_to_qa_in_the_same_unit() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (mapper, _) = state_mapper();
    let (inspect, seen) = InspectQaFactory::new("Inspect", Value::Text("ok".into()));
    engine.register_ingredient(mapper);
    engine.register_ingredient(inspect);

    let env = engine
        .blend(
            "SELECT city FROM w \
             WHERE {{Inspect('all rows look right?', w.city)}} = 'ok' \
             AND {{State('state of', w.city)}} = 'NSW'",
        )
        .expect("blend");

    // The Map call ran first: the QA call's context carries the new column.
    let seen = seen.lock().expect("seen lock poisoned");
    assert!(
        seen.iter().any(|c| c == "state_city"),
        "qa context columns: {seen:?}"
    );
    assert_eq!(env.result.num_rows(), 2);
}

#[test]
fn list_quantified_result_expands_a_membership_predicate() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    engine.register_ingredient(Arc::new(ListQaFactory {
        name: "PickMany".to_string(),
        answers: vec![
            Value::Text("bathurst".into()),
            Value::Text("newcastle".into()),
        ],
    }));

    let env = engine
        .blend("SELECT city FROM w WHERE city IN {{PickMany('both of them', list=true)}} ORDER BY city")
        .expect("blend");
    assert_eq!(env.result.num_rows(), 2);
}

#[test]
fn map_values_already_mapped_are_skipped_across_subqueries() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (mapper, calls) = state_mapper();
    engine.register_ingredient(mapper);

    // The same map call appears in two sibling subqueries; the second
    // execution finds every distinct value already mapped in the session
    // revision and routes zero new values.
    let env = engine
        .blend(
            "SELECT city FROM w \
             WHERE city IN (SELECT city FROM w WHERE {{State('state of', w.city)}} = 'NSW') \
             AND city IN (SELECT city FROM w WHERE {{State('state of', w.city)}} = 'NSW')",
        )
        .expect("blend");

    assert_eq!(env.result.num_rows(), 2);
    assert_eq!(calls.load(Ordering::Relaxed), 2);
    // First execution routes both distinct values, the second none.
    assert_eq!(env.values_passed, 2);
}
