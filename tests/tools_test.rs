//! Tool dispatch: argument checks and policy happen before any connection is touched.

mod common;

use common::{FakeConnector, FakeState, datasource, fake_session};
use db_tool_server::db::QueryExecutor;
use db_tool_server::error::ErrorKind;
use db_tool_server::models::{AccessPolicy, ResolvedLimits};
use db_tool_server::session::SessionState;
use db_tool_server::tools::ToolRegistry;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;

async fn dispatch_err(
    session: &SessionState<FakeConnector>,
    tool: &str,
    arguments: JsonValue,
) -> ErrorKind {
    session.dispatch(tool, arguments).await.unwrap_err().kind()
}

#[tokio::test]
async fn test_denied_statements_never_reach_the_database() {
    let (session, state) = fake_session(AccessPolicy::ReadOnly, 3);

    for sql in [
        "INSERT INTO orders (id) VALUES (1)",
        "UPDATE orders SET total = 0 WHERE id = 1",
        "DROP TABLE orders",
        "CREATE TABLE t (id INT)",
        "SELECT 1; DROP TABLE orders",
        "GRANT ALL ON orders TO PUBLIC",
    ] {
        let kind = dispatch_err(&session, "executeQuery", json!({"datasource": "main", "sql": sql})).await;
        assert_eq!(kind, ErrorKind::PolicyDenied, "{sql}");
    }

    assert_eq!(FakeState::count(&state.connects), 0);
    assert_eq!(FakeState::count(&state.fetches), 0);
    assert_eq!(FakeState::count(&state.executes), 0);
}

#[tokio::test]
async fn test_dangerous_writes_need_opt_in_on_writable_datasource() {
    let (session, state) = fake_session(AccessPolicy::ReadWrite, 0);

    let kind = dispatch_err(
        &session,
        "executeQuery",
        json!({"datasource": "main", "sql": "UPDATE orders SET total = 0"}),
    )
    .await;
    assert_eq!(kind, ErrorKind::PolicyDenied);
    assert_eq!(FakeState::count(&state.executes), 0);

    let result = session
        .dispatch(
            "executeQuery",
            json!({"datasource": "main", "sql": "UPDATE orders SET total = 0", "allowDangerous": true}),
        )
        .await
        .unwrap();
    assert_eq!(result["rowsAffected"], 1);

    let result = session
        .dispatch(
            "executeQuery",
            json!({"datasource": "main", "sql": "UPDATE orders SET total = 0 WHERE id = 4"}),
        )
        .await
        .unwrap();
    assert_eq!(result["rowsAffected"], 1);
    assert_eq!(FakeState::count(&state.executes), 2);
    assert_eq!(
        state.statements(),
        [
            "UPDATE orders SET total = 0",
            "UPDATE orders SET total = 0 WHERE id = 4"
        ]
    );
}

#[tokio::test]
async fn test_invalid_arguments_never_connect() {
    let (session, state) = fake_session(AccessPolicy::ReadOnly, 3);

    let cases = [
        json!({"sql": "SELECT 1"}),
        json!({"datasource": "main"}),
        json!({"datasource": "main", "sql": "   "}),
        json!({"datasource": "", "sql": "SELECT 1"}),
        json!({"datasource": "main", "sql": "SELECT 1", "maxRows": 5}),
        json!({"datasource": "main", "sql": "SELECT 1", "format": "csv"}),
        json!({"datasource": "main", "sql": "SELECT 1", "limits": {"rows": 5}}),
        json!(["main", "SELECT 1"]),
    ];
    for arguments in cases {
        let kind = dispatch_err(&session, "executeQuery", arguments.clone()).await;
        assert_eq!(kind, ErrorKind::InvalidArguments, "{arguments}");
    }

    let kind = dispatch_err(&session, "describeTable", json!({"datasource": "main", "table": ""})).await;
    assert_eq!(kind, ErrorKind::InvalidArguments);

    assert_eq!(FakeState::count(&state.connects), 0);
}

#[tokio::test]
async fn test_unknown_datasource_and_parse_errors() {
    let (session, state) = fake_session(AccessPolicy::ReadOnly, 3);

    let kind = dispatch_err(
        &session,
        "executeQuery",
        json!({"datasource": "elsewhere", "sql": "SELECT 1"}),
    )
    .await;
    assert_eq!(kind, ErrorKind::DatasourceNotFound);

    let err = session
        .dispatch(
            "executeQuery",
            json!({"datasource": "main", "sql": "SELEC * FORM orders"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParseError);
    let payload = err.to_payload();
    assert!(payload.details.is_some());

    assert_eq!(FakeState::count(&state.connects), 0);
}

#[tokio::test]
async fn test_disabled_tool_is_unknown() {
    let mut session = SessionState::new(
        ToolRegistry::new(&["executeQuery"]).unwrap(),
        QueryExecutor::new(ResolvedLimits::default()),
    );
    let connector = FakeConnector::new(1);
    let state = std::sync::Arc::clone(&connector.state);
    session
        .add_datasource(datasource("main", AccessPolicy::ReadOnly, 2), connector)
        .unwrap();

    let kind = dispatch_err(
        &session,
        "executeQuery",
        json!({"datasource": "main", "sql": "SELECT 1"}),
    )
    .await;
    assert_eq!(kind, ErrorKind::UnknownTool);
    assert!(
        session
            .registry()
            .descriptors()
            .iter()
            .all(|d| d.name != "executeQuery")
    );

    let parsed = session
        .dispatch("parseSql", json!({"datasource": "main", "sql": "SELECT 1"}))
        .await
        .unwrap();
    assert_eq!(parsed["allowed"], true);
    assert_eq!(FakeState::count(&state.connects), 0);
}

#[tokio::test]
async fn test_payload_limit_truncates() {
    let (session, state) = fake_session(AccessPolicy::ReadOnly, 50);

    let result = session
        .dispatch(
            "executeQuery",
            json!({
                "datasource": "main",
                "sql": "SELECT id, label FROM items",
                "limits": {"maxPayloadBytes": 200}
            }),
        )
        .await
        .unwrap();
    assert_eq!(result["truncated"], true);
    assert_eq!(result["truncationReason"], "payloadLimit");
    let rows = result["rowCount"].as_u64().unwrap();
    assert!(rows >= 1 && rows < 50, "{rows}");

    // The abandoned stream does not cost the connection.
    let listed = session.dispatch("listDatasources", JsonValue::Null).await.unwrap();
    assert_eq!(listed["datasources"][0]["pool"]["idle"], 1);
    assert_eq!(FakeState::count(&state.closes), 0);
}

#[tokio::test]
async fn test_explain_wraps_statement_for_engine() {
    let (session, state) = fake_session(AccessPolicy::ReadOnly, 2);

    let explained = session
        .dispatch(
            "explainQuery",
            json!({"datasource": "main", "sql": "SELECT * FROM orders WHERE id = $1;", "params": [7]}),
        )
        .await
        .unwrap();
    assert_eq!(
        explained["explainSql"],
        "EXPLAIN (FORMAT JSON) SELECT * FROM orders WHERE id = $1"
    );
    assert_eq!(explained["plan"].as_array().unwrap().len(), 2);
    assert_eq!(
        state.statements(),
        ["EXPLAIN (FORMAT JSON) SELECT * FROM orders WHERE id = $1"]
    );

    let kind = dispatch_err(
        &session,
        "explainQuery",
        json!({"datasource": "main", "sql": "DELETE FROM orders WHERE id = 1", "analyze": true}),
    )
    .await;
    assert_eq!(kind, ErrorKind::PolicyDenied);
    assert_eq!(FakeState::count(&state.fetches), 1);
}

#[tokio::test]
async fn test_list_datasources_reports_pool_state() {
    let (session, _state) = fake_session(AccessPolicy::ReadOnly, 1);
    session
        .dispatch("executeQuery", json!({"datasource": "main", "sql": "SELECT 1"}))
        .await
        .unwrap();

    let listed = session.dispatch("listDatasources", JsonValue::Null).await.unwrap();
    let main = &listed["datasources"][0];
    assert_eq!(main["id"], "main");
    assert_eq!(main["engine"], "postgres");
    assert_eq!(main["pool"]["size"], 1);
    assert_eq!(main["pool"]["idle"], 1);
    assert_eq!(main["pool"]["outstanding"], 0);
    assert!(!listed.to_string().contains("secret"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_query_times_out_and_connection_is_replaced() {
    let (session, state) = fake_session(AccessPolicy::ReadOnly, 3);
    state.set_latency(Duration::from_millis(500));

    let err = session
        .dispatch(
            "executeQuery",
            json!({
                "datasource": "main",
                "sql": "SELECT * FROM orders",
                "limits": {"maxExecutionTimeMs": 50}
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionTimeout);
    let payload = err.to_payload();
    assert_eq!(payload.details.unwrap()["partialRowCount"], 0);

    let listed = session.dispatch("listDatasources", JsonValue::Null).await.unwrap();
    assert_eq!(listed["datasources"][0]["pool"]["size"], 0);

    state.set_latency(Duration::ZERO);
    let result = session
        .dispatch("executeQuery", json!({"datasource": "main", "sql": "SELECT * FROM orders"}))
        .await
        .unwrap();
    assert_eq!(result["rowCount"], 3);
    assert_eq!(FakeState::count(&state.connects), 2);

    let listed = session.dispatch("listDatasources", JsonValue::Null).await.unwrap();
    assert_eq!(listed["datasources"][0]["pool"]["size"], 1);
}
