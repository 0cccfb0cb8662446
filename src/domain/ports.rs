use crate::domain::model::{
    AttributionResult, ExternalQuery, ExtractBatch, LoadOutcome, MetricBatch, QueryCost,
    QueryUsage, RunContext, RunWindow,
};
use crate::utils::error::Result;
use async_trait::async_trait;

/// Observe API 的兩個端點：查詢中繼資料與回寫指標
#[async_trait]
pub trait ObserveApi: Send + Sync {
    async fn external_queries(&self, window: &RunWindow) -> Result<Vec<ExternalQuery>>;
    async fn post_metrics(&self, batch: &MetricBatch) -> Result<()>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query_costs(&self, query_ids: &[String]) -> Result<Vec<QueryCost>>;
    async fn query_usage(&self, query_ids: &[String]) -> Result<Vec<QueryUsage>>;
}

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

pub trait ConfigProvider: Send + Sync {
    fn attribution_lag_hours(&self) -> i64;
    fn include_usage_metrics(&self) -> bool;
    fn audit_enabled(&self) -> bool;
    fn audit_formats(&self) -> &[String];
    fn audit_include_metadata(&self) -> bool;
    fn dry_run(&self) -> bool;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn extract(&self, ctx: &RunContext) -> Result<ExtractBatch>;
    async fn transform(&self, batch: ExtractBatch, ctx: &RunContext) -> Result<AttributionResult>;
    async fn load(&self, result: AttributionResult, ctx: &RunContext) -> Result<LoadOutcome>;

    /// 空視窗短路時 load 不會跑，報告靠這個旗標標記執行模式
    fn dry_run(&self) -> bool {
        false
    }
}
