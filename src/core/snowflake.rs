use crate::domain::model::{QueryCost, QueryUsage};
use crate::domain::ports::Warehouse;
use crate::utils::error::{EtlError, Result};
use crate::utils::retry::{with_retries, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tells Snowflake how to interpret the bearer token.
pub const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

const STATEMENTS_PATH: &str = "/api/v2/statements";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Oauth,
    KeypairJwt,
    ProgrammaticAccessToken,
}

impl TokenType {
    pub fn header_value(&self) -> &'static str {
        match self {
            TokenType::Oauth => "OAUTH",
            TokenType::KeypairJwt => "KEYPAIR_JWT",
            TokenType::ProgrammaticAccessToken => "PROGRAMMATIC_ACCESS_TOKEN",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "OAUTH" => Ok(TokenType::Oauth),
            "KEYPAIR_JWT" => Ok(TokenType::KeypairJwt),
            "PROGRAMMATIC_ACCESS_TOKEN" => Ok(TokenType::ProgrammaticAccessToken),
            other => Err(EtlError::InvalidConfigValueError {
                field: "warehouse.token_type".to_string(),
                value: other.to_string(),
                reason: "Expected OAUTH, KEYPAIR_JWT or PROGRAMMATIC_ACCESS_TOKEN".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarehouseSettings {
    /// `https://{account}.snowflakecomputing.com`
    pub base_url: String,
    pub token: String,
    pub token_type: TokenType,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    /// Server-side statement timeout, also bounds client polling
    pub statement_timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl WarehouseSettings {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            token_type: TokenType::Oauth,
            warehouse: None,
            role: None,
            statement_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }

    pub fn for_account(account: &str, token: impl Into<String>) -> Self {
        Self::new(format!("https://{}.snowflakecomputing.com", account), token)
    }
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    /// 所有值皆以字串回傳，NULL 為 null
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    partition_info: Vec<PartitionInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionInfo {
    #[serde(default)]
    #[allow(dead_code)]
    row_count: u64,
}

#[derive(Clone)]
pub struct SnowflakeClient {
    settings: WarehouseSettings,
    client: Client,
}

impl SnowflakeClient {
    pub fn new(settings: WarehouseSettings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }

    fn statements_url(&self) -> String {
        format!("{}{}", self.settings.base_url, STATEMENTS_PATH)
    }

    fn statement_url(&self, handle: &str) -> String {
        format!("{}/{}", self.statements_url(), handle)
    }

    fn auth_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.settings.token)
            .header(TOKEN_TYPE_HEADER, self.settings.token_type.header_value())
    }

    /// Runs one statement and returns every row across all partitions.
    pub async fn execute(&self, statement: &str) -> Result<Vec<Vec<Option<String>>>> {
        with_retries(self.settings.retry, "Snowflake statement", || {
            self.submit(statement)
        })
        .await
    }

    async fn submit(&self, statement: &str) -> Result<Vec<Vec<Option<String>>>> {
        let request = StatementRequest {
            statement,
            timeout: self.settings.statement_timeout.as_secs(),
            warehouse: self.settings.warehouse.as_deref(),
            role: self.settings.role.as_deref(),
        };

        tracing::debug!("Submitting statement to: {}", self.statements_url());
        let response = self
            .auth_headers(self.client.post(self.statements_url()))
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            200 => {
                let body: StatementResponse = response.json().await?;
                self.collect_rows(body).await
            }
            // 202: 語句仍在執行，改用 handle 輪詢
            202 => {
                let body: StatementResponse = response.json().await?;
                let handle = body.statement_handle.ok_or_else(|| EtlError::ProcessingError {
                    message: "202 response without statementHandle".to_string(),
                })?;
                let body = self.poll_until_done(&handle).await?;
                self.collect_rows(body).await
            }
            _ => Err(Self::error_from_body(status, response).await),
        }
    }

    async fn poll_until_done(&self, handle: &str) -> Result<StatementResponse> {
        let budget = self.settings.statement_timeout;
        let mut waited = Duration::ZERO;

        loop {
            if waited >= budget {
                return Err(EtlError::TimeoutError {
                    operation: "Snowflake statement".to_string(),
                    seconds: budget.as_secs(),
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
            waited += self.settings.poll_interval;

            tracing::debug!("Polling statement {} ({:?} elapsed)", handle, waited);
            let response = self
                .auth_headers(self.client.get(self.statement_url(handle)))
                .send()
                .await?;

            let status = response.status().as_u16();
            match status {
                200 => return Ok(response.json().await?),
                202 => continue,
                _ => return Err(Self::error_from_body(status, response).await),
            }
        }
    }

    async fn fetch_partition(
        &self,
        handle: &str,
        partition: usize,
    ) -> Result<Vec<Vec<Option<String>>>> {
        let response = self
            .auth_headers(self.client.get(self.statement_url(handle)))
            .query(&[("partition", partition.to_string())])
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(Self::error_from_body(status, response).await);
        }

        let body: StatementResponse = response.json().await?;
        Ok(body.data.unwrap_or_default())
    }

    async fn collect_rows(&self, body: StatementResponse) -> Result<Vec<Vec<Option<String>>>> {
        let mut rows = body.data.unwrap_or_default();

        // 第 0 分割已在 data 裡，其餘逐一補抓
        let partitions = body
            .result_set_meta_data
            .map(|meta| meta.partition_info.len())
            .unwrap_or(0);
        if partitions > 1 {
            let handle = body.statement_handle.ok_or_else(|| EtlError::ProcessingError {
                message: "partitioned result without statementHandle".to_string(),
            })?;
            for partition in 1..partitions {
                let mut extra = self.fetch_partition(&handle, partition).await?;
                rows.append(&mut extra);
            }
        }

        Ok(rows)
    }

    async fn error_from_body(status: u16, response: reqwest::Response) -> EtlError {
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<StatementResponse>(&text) {
            Ok(body) => EtlError::WarehouseError {
                status,
                code: body.code.unwrap_or_else(|| status.to_string()),
                message: body.message.unwrap_or(text),
            },
            Err(_) => EtlError::WarehouseError {
                status,
                code: status.to_string(),
                message: text,
            },
        }
    }
}

/// Quotes query ids for an IN list. Ids outside the Snowflake query-id
/// charset are rejected so arbitrary text can never reach the statement.
pub fn in_list(query_ids: &[String]) -> Result<String> {
    for id in query_ids {
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
        if !valid {
            return Err(EtlError::ValidationError {
                message: format!("'{}' is not a valid Snowflake query id", id),
            });
        }
    }
    Ok(query_ids
        .iter()
        .map(|id| format!("'{}'", id))
        .collect::<Vec<_>>()
        .join(", "))
}

pub fn cost_statement(in_list: &str) -> String {
    format!(
        "select query_id, end_time, credits_attributed_compute \
         from snowflake.account_usage.query_attribution_history \
         where query_id in ({})",
        in_list
    )
}

pub fn usage_statement(in_list: &str) -> String {
    format!(
        "select query_id, rows_produced, rows_inserted, rows_updated, rows_deleted, \
         rows_unloaded, total_elapsed_time, bytes_scanned, end_time \
         from snowflake.account_usage.query_history \
         where query_id in ({})",
        in_list
    )
}

/// Snowflake 回傳的時間戳是「epoch 秒.小數」字串（TIMESTAMP_TZ 會再帶一段
/// 時區 token），RFC 3339 當後備格式
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let first = raw.split_whitespace().next().unwrap_or(raw);
    let (secs_str, frac) = first.split_once('.').unwrap_or((first, ""));

    if let Ok(secs) = secs_str.parse::<i64>() {
        let nanos = if frac.is_empty() {
            0
        } else {
            let digits: String = frac.chars().take(9).collect();
            let padded = format!("{:0<9}", digits);
            padded.parse::<u32>().map_err(|_| EtlError::ProcessingError {
                message: format!("invalid timestamp fraction: '{}'", raw),
            })?
        };
        return DateTime::from_timestamp(secs, nanos).ok_or_else(|| EtlError::ProcessingError {
            message: format!("timestamp out of range: '{}'", raw),
        });
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| EtlError::ProcessingError {
            message: format!("unparseable timestamp: '{}'", raw),
        })
}

fn required_column<'a>(row: &'a [Option<String>], index: usize, name: &str) -> Result<&'a str> {
    row.get(index)
        .and_then(|value| value.as_deref())
        .ok_or_else(|| EtlError::ProcessingError {
            message: format!("column '{}' missing or null in result row", name),
        })
}

fn optional_count(row: &[Option<String>], index: usize, name: &str) -> Result<Option<i64>> {
    match row.get(index).and_then(|value| value.as_deref()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| EtlError::ProcessingError {
                message: format!("column '{}' is not an integer: '{}'", name, raw),
            }),
    }
}

pub fn parse_cost_row(row: &[Option<String>]) -> Result<QueryCost> {
    if row.len() < 3 {
        return Err(EtlError::ProcessingError {
            message: format!("cost row has {} columns, expected 3", row.len()),
        });
    }

    let credits = match row[2].as_deref() {
        // 視圖中的 NULL credits 視為 0
        None => 0.0,
        Some(raw) => raw.parse::<f64>().map_err(|_| EtlError::ProcessingError {
            message: format!("credits_attributed_compute is not numeric: '{}'", raw),
        })?,
    };

    Ok(QueryCost {
        query_id: required_column(row, 0, "query_id")?.to_string(),
        end_time: parse_timestamp(required_column(row, 1, "end_time")?)?,
        credits,
    })
}

pub fn parse_usage_row(row: &[Option<String>]) -> Result<QueryUsage> {
    if row.len() < 9 {
        return Err(EtlError::ProcessingError {
            message: format!("usage row has {} columns, expected 9", row.len()),
        });
    }

    Ok(QueryUsage {
        query_id: required_column(row, 0, "query_id")?.to_string(),
        rows_produced: optional_count(row, 1, "rows_produced")?,
        rows_inserted: optional_count(row, 2, "rows_inserted")?,
        rows_updated: optional_count(row, 3, "rows_updated")?,
        rows_deleted: optional_count(row, 4, "rows_deleted")?,
        rows_unloaded: optional_count(row, 5, "rows_unloaded")?,
        total_elapsed_time: optional_count(row, 6, "total_elapsed_time")?,
        bytes_scanned: optional_count(row, 7, "bytes_scanned")?,
        end_time: parse_timestamp(required_column(row, 8, "end_time")?)?,
    })
}

#[async_trait]
impl Warehouse for SnowflakeClient {
    async fn query_costs(&self, query_ids: &[String]) -> Result<Vec<QueryCost>> {
        if query_ids.is_empty() {
            return Ok(Vec::new());
        }
        let statement = cost_statement(&in_list(query_ids)?);
        let rows = self.execute(&statement).await?;
        rows.iter().map(|row| parse_cost_row(row)).collect()
    }

    async fn query_usage(&self, query_ids: &[String]) -> Result<Vec<QueryUsage>> {
        if query_ids.is_empty() {
            return Ok(Vec::new());
        }
        let statement = usage_statement(&in_list(query_ids)?);
        let rows = self.execute(&statement).await?;
        rows.iter().map(|row| parse_usage_row(row)).collect()
    }
}
