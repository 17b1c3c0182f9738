use std::sync::atomic::Ordering;
use std::sync::Arc;

use simmer_backend::{Database, Value};
use simmer_client::Engine;
use simmer_common::{EngineConfig, SimmerError};

#[path = "support/mod.rs"]
mod support;

use support::{fixture_db, EchoFactory, FixedQaFactory};

#[test]
fn pick_city_scenario_returns_matching_row() {
    let db = fixture_db();
    let mut engine = Engine::new(db.clone(), EngineConfig::default());
    let (factory, calls) = FixedQaFactory::new("PickCity", Value::Text("bathurst".into()));
    engine.register_ingredient(factory);

    let env = engine
        .blend("SELECT * FROM w WHERE city = {{PickCity('closest to Sydney', options='w::city')}}")
        .expect("blend");

    assert_eq!(env.result.num_rows(), 1);
    let cities = env.result.column_values("city").expect("city column");
    assert_eq!(cities, vec![Value::Text("bathurst".into())]);
    // Two distinct city values were routed as options.
    assert_eq!(env.values_passed, 2);
    assert_eq!(env.generation_calls, 1);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert!(env.contains_ingredient);
    // The stub reports one prompt token per question word.
    assert_eq!(env.prompt_tokens, 3);
    assert_eq!(env.completion_tokens, 1);
}

#[test]
fn pick_city_scenario_yields_zero_rows_for_absent_value() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (factory, _) = FixedQaFactory::new("PickCity", Value::Text("sydney".into()));
    engine.register_ingredient(factory);

    let env = engine
        .blend("SELECT * FROM w WHERE city = {{PickCity('closest to Sydney', options='w::city')}}")
        .expect("blend");
    assert_eq!(env.result.num_rows(), 0);
}

#[test]
fn hybrid_result_equals_plain_sql_with_inlined_literal() {
    let db = fixture_db();
    let mut engine = Engine::new(db.clone(), EngineConfig::default());
    let (factory, _) = FixedQaFactory::new("PickCity", Value::Text("newcastle".into()));
    engine.register_ingredient(factory);

    let hybrid = engine
        .blend("SELECT date, rival FROM w WHERE city = {{PickCity('up the coast')}} ORDER BY date")
        .expect("blend");
    let plain = db
        .execute_to_relation("SELECT date, rival FROM w WHERE city = 'newcastle' ORDER BY date")
        .expect("plain sql");
    assert_eq!(hybrid.result, plain);
}

#[test]
fn identical_calls_invoke_the_ingredient_once() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (factory, calls) = FixedQaFactory::new("PickCity", Value::Text("bathurst".into()));
    engine.register_ingredient(factory);

    let env = engine
        .blend(
            "SELECT {{PickCity('closest to Sydney')}} FROM w \
             WHERE city = {{PickCity('closest to Sydney')}}",
        )
        .expect("blend");
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(env.generation_calls, 1);
    // Both occurrences resolved to the same output.
    assert_eq!(env.result.num_rows(), 1);
    let picked = env.result.rows()[0][0].clone();
    assert_eq!(picked, Value::Text("bathurst".into()));
}

#[test]
fn plain_sql_takes_the_fast_path() {
    let db = fixture_db();
    let engine = Engine::new(db, EngineConfig::default());
    let env = engine
        .blend("SELECT city FROM w ORDER BY city")
        .expect("blend");
    assert!(!env.contains_ingredient);
    assert_eq!(env.values_passed, 0);
    assert_eq!(env.generation_calls, 0);
    assert_eq!(env.result.num_rows(), 2);
}

#[test]
fn mutating_statements_are_rejected_before_any_ingredient_runs() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (factory, calls) = FixedQaFactory::new("PickCity", Value::Text("bathurst".into()));
    engine.register_ingredient(factory);

    for sql in [
        "DELETE FROM w WHERE TRUE",
        "DROP TABLE w",
        "DELETE FROM w WHERE city = {{PickCity('closest to Sydney')}}",
    ] {
        let err = engine.blend(sql).expect_err("must be rejected");
        assert!(matches!(err, SimmerError::InvalidQuery(_)), "got {err} for {sql}");
    }
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn string_ingredient_is_spliced_as_text() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    engine.register_ingredient(Arc::new(EchoFactory {
        name: "Echo".to_string(),
    }));

    let env = engine
        .blend("SELECT {{Echo('hello')}} FROM w")
        .expect("blend");
    assert_eq!(env.result.num_rows(), 2);
    assert_eq!(env.result.rows()[0][0], Value::Text("hello".into()));
}

#[test]
fn session_temp_tables_are_dropped_after_the_outermost_call() {
    let db = fixture_db();
    let mut engine = Engine::new(db.clone(), EngineConfig::default());
    let (factory, _) = FixedQaFactory::new("PickCity", Value::Text("bathurst".into()));
    engine.register_ingredient(factory);

    engine
        .blend("SELECT * FROM w WHERE city = {{PickCity('closest to Sydney', options='w::city')}}")
        .expect("blend");

    // The fixture table itself survives; the session namespace does not.
    let temp = db
        .execute_to_relation("SELECT COUNT(*) AS n FROM sqlite_temp_master WHERE type = 'table'")
        .expect("introspection");
    assert_eq!(temp.rows()[0][0], Value::Integer(0));
    assert_eq!(
        db.execute_to_relation("SELECT * FROM w").expect("base table").num_rows(),
        2
    );
}

#[test]
fn unknown_ingredient_fails_before_execution() {
    let db = fixture_db();
    let engine = Engine::new(db, EngineConfig::default());
    let err = engine
        .blend("SELECT * FROM w WHERE city = {{Mystery('x')}}")
        .expect_err("unknown ingredient");
    assert!(matches!(err, SimmerError::UnknownIngredient(_)));
}

#[test]
fn grammar_errors_surface_unretried() {
    let db = fixture_db();
    let mut engine = Engine::new(db, EngineConfig::default());
    let (factory, _) = FixedQaFactory::new("PickCity", Value::Text("bathurst".into()));
    engine.register_ingredient(factory);

    let err = engine
        .blend("SELECT * FROM w WHERE city = {{PickCity('unterminated'")
        .expect_err("grammar error");
    assert!(matches!(err, SimmerError::Grammar(_)));
}
