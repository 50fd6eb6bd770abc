//! Classifier and policy tests through the public API.
//!
//! Covers the batching rule across all dialects with generated inputs and the
//! read-only gate in front of execution.

use db_tool_server::error::ErrorKind;
use db_tool_server::models::{AccessPolicy, EngineKind};
use db_tool_server::sql::{
    PolicyContext, SqlDialect, StatementCategory, authorize, classify, evaluate,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const DIALECTS: [EngineKind; 3] = [EngineKind::MySql, EngineKind::Postgres, EngineKind::Sqlite];

const STATEMENTS: &[&str] = &[
    "SELECT 1",
    "SELECT * FROM orders",
    "SELECT id, 'a;b' FROM orders WHERE note = ';'",
    "INSERT INTO orders (id) VALUES (1)",
    "UPDATE orders SET status = 'x' WHERE id = 1",
    "DELETE FROM orders",
    "DROP TABLE orders",
    "CREATE TABLE t (id INT)",
    "WITH x AS (SELECT 1) SELECT * FROM x",
];

const SEPARATORS: &[&str] = &[";", "; ", ";\n", " ;\t", ";/* gap */", ";\n-- trailing note\n"];

fn read_only() -> PolicyContext {
    PolicyContext::new(AccessPolicy::ReadOnly, false)
}

#[test]
fn test_scenario_select_allowed_under_read_only() {
    let dialect = SqlDialect::new(EngineKind::Postgres);
    let classification = evaluate(
        classify("SELECT * FROM orders", &dialect).unwrap(),
        read_only(),
    );
    assert_eq!(classification.category, StatementCategory::Read);
    assert!(classification.allowed);
    assert_eq!(classification.tables, vec!["orders".to_string()]);
}

#[test]
fn test_scenario_batch_denied_under_any_policy() {
    for engine in DIALECTS {
        let dialect = SqlDialect::new(engine);
        for policy in [AccessPolicy::ReadOnly, AccessPolicy::ReadWrite] {
            for allow_dangerous in [false, true] {
                let classification = evaluate(
                    classify("DELETE FROM orders; SELECT 1", &dialect).unwrap(),
                    PolicyContext::new(policy, allow_dangerous),
                );
                assert_eq!(classification.category, StatementCategory::Unsupported);
                assert!(!classification.allowed, "{engine} {policy}");
            }
        }
    }
}

#[test]
fn test_generated_batches_are_always_unsupported() {
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    for _ in 0..500 {
        let engine = *DIALECTS.choose(&mut rng).unwrap();
        let first = STATEMENTS.choose(&mut rng).unwrap();
        let second = STATEMENTS.choose(&mut rng).unwrap();
        let sep = SEPARATORS.choose(&mut rng).unwrap();
        let trailing = if rng.gen_bool(0.5) { ";" } else { "" };
        let sql = format!("{first}{sep}{second}{trailing}");

        match classify(&sql, &SqlDialect::new(engine)) {
            Ok(classification) => assert_eq!(
                classification.category,
                StatementCategory::Unsupported,
                "{engine}: {sql}"
            ),
            // Denied either way: a parse error never executes.
            Err(_) => {}
        }
    }
}

#[test]
fn test_single_statements_with_trailing_terminator_are_not_batches() {
    for engine in DIALECTS {
        let dialect = SqlDialect::new(engine);
        for sql in STATEMENTS {
            let with_terminator = format!("{sql};");
            let plain = classify(sql, &dialect).unwrap();
            let terminated = classify(&with_terminator, &dialect).unwrap();
            assert_eq!(plain.category, terminated.category, "{engine}: {sql}");
            assert_ne!(plain.category, StatementCategory::Unsupported, "{engine}: {sql}");
        }
    }
}

#[test]
fn test_read_only_blocks_every_write() {
    let dialect = SqlDialect::new(EngineKind::MySql);
    for sql in STATEMENTS {
        let classification = classify(sql, &dialect).unwrap();
        let is_write = classification.category.is_write();
        let verdict = authorize(*sql, classification, read_only());
        if is_write {
            let err = verdict.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PolicyDenied, "{sql}");
        } else {
            assert!(verdict.unwrap().is_read(), "{sql}");
        }
    }
}

#[test]
fn test_dangerous_writes_need_explicit_opt_in() {
    let dialect = SqlDialect::new(EngineKind::Postgres);
    let read_write = PolicyContext::new(AccessPolicy::ReadWrite, false);
    let opted_in = PolicyContext::new(AccessPolicy::ReadWrite, true);

    for sql in ["DROP TABLE orders", "DELETE FROM orders", "TRUNCATE orders"] {
        let classification = classify(sql, &dialect).unwrap();
        assert!(classification.hazard.is_some(), "{sql}");
        assert!(authorize(sql, classification.clone(), read_write).is_err(), "{sql}");
        assert!(authorize(sql, classification, opted_in).is_ok(), "{sql}");
    }

    let scoped = classify("DELETE FROM orders WHERE id = 3", &dialect).unwrap();
    assert!(scoped.hazard.is_none());
    assert!(authorize("DELETE FROM orders WHERE id = 3", scoped, read_write).is_ok());
}

#[test]
fn test_unparseable_input_is_an_error_not_a_verdict() {
    for engine in DIALECTS {
        let err = classify("SELEC * FRM orders", &SqlDialect::new(engine)).unwrap_err();
        assert!(err.line >= 1);
        assert!(err.column >= 1);
    }
}

#[test]
fn test_nested_dangerous_writes_need_opt_in() {
    let dialect = SqlDialect::new(EngineKind::Postgres);
    let read_write = PolicyContext::new(AccessPolicy::ReadWrite, false);
    let opted_in = PolicyContext::new(AccessPolicy::ReadWrite, true);

    for sql in [
        "WITH x AS (SELECT 1) DELETE FROM orders",
        "WITH d AS (DELETE FROM orders RETURNING *) SELECT * FROM d",
        "EXPLAIN ANALYZE DROP TABLE orders",
    ] {
        let classification = classify(sql, &dialect).unwrap();
        assert!(classification.category.is_write(), "{sql}");
        assert!(classification.hazard.is_some(), "{sql}");
        let err = authorize(sql, classification.clone(), read_write).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyDenied, "{sql}");
        assert!(authorize(sql, classification, opted_in).is_ok(), "{sql}");
    }
}

#[test]
fn test_select_into_in_union_denied_under_read_only() {
    let dialect = SqlDialect::new(EngineKind::Postgres);
    let sql = "SELECT * INTO backup FROM orders UNION SELECT * FROM orders";
    let classification = classify(sql, &dialect).unwrap();
    assert_eq!(classification.category, StatementCategory::Mutate);
    let err = authorize(sql, classification, read_only()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PolicyDenied);
}
