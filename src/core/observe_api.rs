use crate::domain::model::{format_api_timestamp, ExternalQuery, MetricBatch, RunWindow};
use crate::domain::ports::ObserveApi;
use crate::utils::error::{EtlError, Result};
use crate::utils::retry::{with_retries, RetryPolicy};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Public API base; dev/stage stacks override it via config.
pub const DEFAULT_BASE_URL: &str = "https://api.astronomer.io/private/v1alpha1";

/// Header identifying the calling client to the API.
pub const CLIENT_IDENTIFIER_HEADER: &str = "X-Astro-Client-Identifier";

pub const DEFAULT_CLIENT_IDENTIFIER: &str = "astro-observe-sdk";

#[derive(Debug, Clone)]
pub struct ObserveSettings {
    pub base_url: String,
    pub organization_id: String,
    pub auth_token: String,
    pub client_identifier: String,
    /// Timeout for the metadata GET
    pub request_timeout: Duration,
    /// Timeout for metric POSTs; posting a large hour can be slow
    pub post_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ObserveSettings {
    pub fn new(organization_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            organization_id: organization_id.into(),
            auth_token: auth_token.into(),
            client_identifier: DEFAULT_CLIENT_IDENTIFIER.to_string(),
            request_timeout: Duration::from_secs(30),
            post_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalQueriesResponse {
    // 缺 key 時視為空清單
    #[serde(default)]
    external_queries: Vec<ExternalQuery>,
}

#[derive(Clone)]
pub struct ObserveClient {
    settings: ObserveSettings,
    client: Client,
}

impl ObserveClient {
    pub fn new(settings: ObserveSettings) -> Self {
        Self {
            settings,
            client: Client::new(),
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.settings.organization_id
    }

    fn external_queries_url(&self) -> String {
        format!(
            "{}/organizations/{}/observability/external-queries",
            self.settings.base_url, self.settings.organization_id
        )
    }

    fn metrics_url(&self) -> String {
        format!(
            "{}/organizations/{}/observability/metrics",
            self.settings.base_url, self.settings.organization_id
        )
    }

    async fn fetch_once(&self, window: &RunWindow) -> Result<Vec<ExternalQuery>> {
        let url = self.external_queries_url();
        tracing::debug!("Fetching external queries from: {}", url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("earliestTime", format_api_timestamp(window.start)),
                ("latestTime", format_api_timestamp(window.end)),
            ])
            .bearer_auth(&self.settings.auth_token)
            .header(CLIENT_IDENTIFIER_HEADER, &self.settings.client_identifier)
            .timeout(self.settings.request_timeout)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("External queries response status: {}", status);

        if !status.is_success() {
            return Err(EtlError::ObserveApiError {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: ExternalQueriesResponse = response.json().await?;
        Ok(body.external_queries)
    }

    async fn post_once(&self, batch: &MetricBatch) -> Result<()> {
        let response = self
            .client
            .post(self.metrics_url())
            .bearer_auth(&self.settings.auth_token)
            .header(CLIENT_IDENTIFIER_HEADER, &self.settings.client_identifier)
            .timeout(self.settings.post_timeout)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        // 指標端點僅以 200 為成功
        if status.as_u16() != 200 {
            return Err(EtlError::ObserveApiError {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl ObserveApi for ObserveClient {
    async fn external_queries(&self, window: &RunWindow) -> Result<Vec<ExternalQuery>> {
        with_retries(self.settings.retry, "External queries fetch", || {
            self.fetch_once(window)
        })
        .await
    }

    async fn post_metrics(&self, batch: &MetricBatch) -> Result<()> {
        with_retries(self.settings.retry, "Metrics post", || self.post_once(batch)).await
    }
}
