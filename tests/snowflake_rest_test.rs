use anyhow::Result;
use cost_attribution_etl::core::snowflake::{SnowflakeClient, TokenType, WarehouseSettings};
use cost_attribution_etl::core::Warehouse;
use cost_attribution_etl::utils::error::EtlError;
use cost_attribution_etl::utils::retry::RetryPolicy;
use httpmock::prelude::*;
use std::time::Duration;

fn test_settings(server: &MockServer) -> WarehouseSettings {
    let mut settings = WarehouseSettings::new(server.base_url(), "sf-token");
    settings.token_type = TokenType::ProgrammaticAccessToken;
    settings.warehouse = Some("COST_WH".to_string());
    settings.statement_timeout = Duration::from_secs(5);
    settings.poll_interval = Duration::from_millis(5);
    settings.retry = RetryPolicy::none();
    settings
}

fn completed_body(rows: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "resultSetMetaData": {
            "numRows": 1,
            "partitionInfo": [ { "rowCount": 1 } ]
        },
        "data": rows,
        "code": "090001",
        "statementHandle": "01b8-handle",
        "message": "Statement executed successfully."
    })
}

/// 語句以 JSON 提交，認證走 bearer token 加 token type 標頭
#[tokio::test]
async fn test_execute_submits_statement_with_auth() -> Result<()> {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v2/statements")
            .header("authorization", "Bearer sf-token")
            .header(
                "x-snowflake-authorization-token-type",
                "PROGRAMMATIC_ACCESS_TOKEN",
            )
            .json_body_partial(
                r#"{
                    "statement": "select 1",
                    "timeout": 5,
                    "warehouse": "COST_WH"
                }"#,
            );
        then.status(200)
            .json_body(completed_body(serde_json::json!([["1"]])));
    });

    let client = SnowflakeClient::new(test_settings(&server));
    let rows = client.execute("select 1").await?;

    mock.assert();
    assert_eq!(rows, vec![vec![Some("1".to_string())]]);

    Ok(())
}

/// 多分割結果：第 0 分割在首個回應裡，其餘用 ?partition=N 補抓
#[tokio::test]
async fn test_execute_appends_remaining_partitions() -> Result<()> {
    let server = MockServer::start();

    let partition_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/v2/statements/01b8-handle")
            .query_param("partition", "1")
            .header("authorization", "Bearer sf-token");
        then.status(200).json_body(serde_json::json!({
            "data": [ ["01b2-bbbb", "1730422800", "0.002"] ]
        }));
    });

    let submit_mock = server.mock(|when, then| {
        when.method(POST).path("/api/v2/statements");
        then.status(200).json_body(serde_json::json!({
            "resultSetMetaData": {
                "numRows": 2,
                "partitionInfo": [ { "rowCount": 1 }, { "rowCount": 1 } ]
            },
            "data": [ ["01b2-aaaa", "1730419200", "0.001"] ],
            "statementHandle": "01b8-handle"
        }));
    });

    let client = SnowflakeClient::new(test_settings(&server));
    let rows = client.execute("select ...").await?;

    submit_mock.assert();
    partition_mock.assert();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0].as_deref(), Some("01b2-aaaa"));
    assert_eq!(rows[1][0].as_deref(), Some("01b2-bbbb"));

    Ok(())
}

/// 202 回應代表語句還在跑，用 handle 輪詢到 200 為止
#[tokio::test]
async fn test_async_submission_polls_until_complete() -> Result<()> {
    let server = MockServer::start();

    let submit_mock = server.mock(|when, then| {
        when.method(POST).path("/api/v2/statements");
        then.status(202).json_body(serde_json::json!({
            "code": "333334",
            "statementHandle": "01b8-async",
            "message": "Asynchronous execution in progress."
        }));
    });

    let poll_mock = server.mock(|when, then| {
        when.method(GET).path("/api/v2/statements/01b8-async");
        then.status(200)
            .json_body(completed_body(serde_json::json!([["42"]])));
    });

    let client = SnowflakeClient::new(test_settings(&server));
    let rows = client.execute("select 42").await?;

    submit_mock.assert();
    poll_mock.assert();
    assert_eq!(rows, vec![vec![Some("42".to_string())]]);

    Ok(())
}

/// 輪詢預算等同 statement timeout，用完就放棄
#[tokio::test]
async fn test_polling_gives_up_after_timeout_budget() -> Result<()> {
    let server = MockServer::start();

    let _submit_mock = server.mock(|when, then| {
        when.method(POST).path("/api/v2/statements");
        then.status(202).json_body(serde_json::json!({
            "statementHandle": "01b8-slow"
        }));
    });

    let poll_mock = server.mock(|when, then| {
        when.method(GET).path("/api/v2/statements/01b8-slow");
        then.status(202).json_body(serde_json::json!({
            "statementHandle": "01b8-slow"
        }));
    });

    let mut settings = test_settings(&server);
    settings.statement_timeout = Duration::from_millis(30);
    settings.poll_interval = Duration::from_millis(10);
    let client = SnowflakeClient::new(settings);

    let err = client.execute("select pg_sleep(60)").await.unwrap_err();
    assert!(matches!(err, EtlError::TimeoutError { .. }));
    assert!(poll_mock.hits() >= 1);

    Ok(())
}

/// Snowflake 錯誤回應帶 code 與 message，不重試
#[tokio::test]
async fn test_statement_errors_map_code_and_message() -> Result<()> {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/v2/statements");
        then.status(422).json_body(serde_json::json!({
            "code": "002003",
            "message": "SQL compilation error:\nObject 'NOPE' does not exist or not authorized."
        }));
    });

    let mut settings = test_settings(&server);
    settings.retry = RetryPolicy::new(3, Duration::from_millis(1));
    let client = SnowflakeClient::new(settings);

    let err = client.execute("select * from nope").await.unwrap_err();
    match err {
        EtlError::WarehouseError {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 422);
            assert_eq!(code, "002003");
            assert!(message.contains("compilation"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // 4xx 是語句本身的問題，重試也不會過
    mock.assert_hits(1);

    Ok(())
}

/// Snowflake 回 5xx 屬暫時性，吃滿重試次數後才放棄
#[tokio::test]
async fn test_transient_warehouse_errors_are_retried() -> Result<()> {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/v2/statements");
        then.status(503).body("Service Unavailable");
    });

    let mut settings = test_settings(&server);
    settings.retry = RetryPolicy::new(2, Duration::from_millis(1));
    let client = SnowflakeClient::new(settings);

    let err = client.execute("select 1").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        EtlError::WarehouseError { status: 503, .. }
    ));

    // 1 次原始請求 + 2 次重試
    mock.assert_hits(3);

    Ok(())
}

/// Warehouse trait 整條路：組 in-list、送語句、解析成本列
#[tokio::test]
async fn test_query_costs_end_to_end() -> Result<()> {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/v2/statements")
            .body_contains("snowflake.account_usage.query_attribution_history")
            .body_contains("'01b2-aaaa', '01b2-bbbb'");
        then.status(200).json_body(serde_json::json!({
            "resultSetMetaData": { "partitionInfo": [ { "rowCount": 2 } ] },
            "data": [
                ["01b2-aaaa", "1730419200.000000000", "0.000123"],
                ["01b2-bbbb", "1730422800.500000000", null]
            ],
            "statementHandle": "01b8-costs"
        }));
    });

    let client = SnowflakeClient::new(test_settings(&server));
    let costs = client
        .query_costs(&["01b2-aaaa".to_string(), "01b2-bbbb".to_string()])
        .await?;

    mock.assert();
    assert_eq!(costs.len(), 2);
    assert_eq!(costs[0].query_id, "01b2-aaaa");
    assert_eq!(costs[0].credits, 0.000123);
    // NULL credits 正規化為 0
    assert_eq!(costs[1].credits, 0.0);

    Ok(())
}

/// 空的 id 清單不打倉儲
#[tokio::test]
async fn test_empty_id_list_skips_the_warehouse() -> Result<()> {
    let server = MockServer::start();

    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/v2/statements");
        then.status(200)
            .json_body(completed_body(serde_json::json!([])));
    });

    let client = SnowflakeClient::new(test_settings(&server));
    let costs = client.query_costs(&[]).await?;
    let usage = client.query_usage(&[]).await?;

    assert!(costs.is_empty());
    assert!(usage.is_empty());
    mock.assert_hits(0);

    Ok(())
}
