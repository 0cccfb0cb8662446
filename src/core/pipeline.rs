use crate::domain::model::{
    format_api_timestamp, AttributionResult, ExtractBatch, LoadOutcome, MetricBatch, MetricPoint,
    RunContext, UsageSeries,
};
use crate::domain::ports::{ConfigProvider, ObserveApi, Pipeline, Storage, Warehouse};
use crate::utils::error::{EtlError, Result};
use std::io::Write;
use zip::write::{FileOptions, ZipWriter};

pub struct AttributionPipeline<A: ObserveApi, W: Warehouse, S: Storage, C: ConfigProvider> {
    observe: A,
    warehouse: W,
    storage: S,
    config: C,
}

impl<A: ObserveApi, W: Warehouse, S: Storage, C: ConfigProvider> AttributionPipeline<A, W, S, C> {
    pub fn new(observe: A, warehouse: W, storage: S, config: C) -> Self {
        Self {
            observe,
            warehouse,
            storage,
            config,
        }
    }

    async fn write_audit_bundle(
        &self,
        result: &AttributionResult,
        ctx: &RunContext,
    ) -> Result<String> {
        let filename = format!("cost_attribution_{}.zip", ctx.execution_id);
        let formats = self.config.audit_formats();

        let zip_data = {
            let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));

            if formats.iter().any(|f| f == "json") {
                zip.start_file::<_, ()>("metrics.json", FileOptions::default())?;
                let json_data = serde_json::to_string_pretty(&result.batches)?;
                zip.write_all(json_data.as_bytes())?;
            }

            if formats.iter().any(|f| f == "csv") {
                zip.start_file::<_, ()>("costs.csv", FileOptions::default())?;
                zip.write_all(result.audit_csv.as_bytes())?;
            }

            if self.config.audit_include_metadata() {
                zip.start_file::<_, ()>("metadata.json", FileOptions::default())?;
                let metadata = serde_json::json!({
                    "executionId": ctx.execution_id,
                    "window": ctx.window,
                    "batches": result.batches.len(),
                    "costPoints": result.cost_points,
                    "usagePoints": result.usage_points,
                    "skippedUnknown": result.skipped_unknown,
                });
                zip.write_all(serde_json::to_string_pretty(&metadata)?.as_bytes())?;
            }

            // 完成並取回底層 Vec<u8>
            let cursor = zip.finish()?;
            cursor.into_inner()
        };

        tracing::debug!("Writing audit bundle ({} bytes) to storage", zip_data.len());
        self.storage.write_file(&filename, &zip_data).await?;

        Ok(filename)
    }
}

#[async_trait::async_trait]
impl<A: ObserveApi, W: Warehouse, S: Storage, C: ConfigProvider> Pipeline
    for AttributionPipeline<A, W, S, C>
{
    async fn extract(&self, ctx: &RunContext) -> Result<ExtractBatch> {
        // query_attribution_history 最多落後 8 小時，查詢視窗整段往回平移
        let window = ctx.window.lagged(self.config.attribution_lag_hours());
        tracing::debug!(
            "Fetching external queries for {} .. {}",
            format_api_timestamp(window.start),
            format_api_timestamp(window.end)
        );

        let queries = self.observe.external_queries(&window).await?;
        if queries.is_empty() {
            return Ok(ExtractBatch::empty(window));
        }
        tracing::info!("🆔 {} external queries in window", queries.len());

        let ids: Vec<String> = queries.iter().map(|q| q.query_id.clone()).collect();
        let costs = self.warehouse.query_costs(&ids).await?;
        let usage = if self.config.include_usage_metrics() {
            self.warehouse.query_usage(&ids).await?
        } else {
            Vec::new()
        };

        Ok(ExtractBatch {
            window,
            queries,
            costs,
            usage,
        })
    }

    async fn transform(&self, batch: ExtractBatch, _ctx: &RunContext) -> Result<AttributionResult> {
        let query_map = batch.query_map();
        let mut skipped_unknown = 0usize;

        let mut audit = csv::Writer::from_writer(Vec::new());
        audit.write_record([
            "query_id",
            "dag_id",
            "task_id",
            "run_id",
            "namespace",
            "timestamp",
            "credits",
        ])?;

        let mut cost_points: Vec<MetricPoint> = Vec::new();
        for cost in &batch.costs {
            match query_map.get(cost.query_id.as_str()) {
                Some(query) => {
                    let timestamp = format_api_timestamp(cost.end_time);
                    audit.write_record([
                        cost.query_id.as_str(),
                        query.dag_id.as_str(),
                        query.task_id.as_str(),
                        query.run_id.as_str(),
                        query.namespace.as_str(),
                        timestamp.as_str(),
                        cost.credits.to_string().as_str(),
                    ])?;
                    cost_points.push(MetricPoint::from_attribution(
                        query,
                        cost.credits,
                        cost.end_time,
                    ));
                }
                None => {
                    // 視圖可能回吐視窗外的查詢，跳過並留下紀錄
                    tracing::warn!("No metadata for cost row query_id={}, skipping", cost.query_id);
                    skipped_unknown += 1;
                }
            }
        }

        for usage in &batch.usage {
            if !query_map.contains_key(usage.query_id.as_str()) {
                tracing::warn!(
                    "No metadata for usage row query_id={}, skipping",
                    usage.query_id
                );
                skipped_unknown += 1;
            }
        }

        let cost_point_count = cost_points.len();
        let mut batches: Vec<MetricBatch> = Vec::new();
        if cost_points.is_empty() {
            tracing::info!("No costs to post");
        } else {
            batches.push(MetricBatch::cost(cost_points));
        }

        let mut usage_point_count = 0usize;
        if !batch.usage.is_empty() {
            for series in UsageSeries::ALL {
                let points: Vec<MetricPoint> = batch
                    .usage
                    .iter()
                    .filter_map(|usage| {
                        query_map.get(usage.query_id.as_str()).map(|query| {
                            MetricPoint::from_attribution(
                                query,
                                series.value(usage),
                                usage.end_time,
                            )
                        })
                    })
                    .collect();
                if !points.is_empty() {
                    usage_point_count += points.len();
                    batches.push(MetricBatch::usage(series, points));
                }
            }
        }

        let audit_csv = String::from_utf8(audit.into_inner().map_err(|e| {
            EtlError::ProcessingError {
                message: format!("audit csv buffer: {}", e),
            }
        })?)
        .map_err(|e| EtlError::ProcessingError {
            message: format!("audit csv encoding: {}", e),
        })?;

        Ok(AttributionResult {
            batches,
            cost_points: cost_point_count,
            usage_points: usage_point_count,
            skipped_unknown,
            audit_csv,
        })
    }

    async fn load(&self, result: AttributionResult, ctx: &RunContext) -> Result<LoadOutcome> {
        let mut batches_posted = 0usize;
        let mut points_posted = 0usize;

        if self.config.dry_run() {
            tracing::info!(
                "⏭️ Dry-run: skipping POST of {} metric batches",
                result.batches.len()
            );
        } else {
            for batch in &result.batches {
                tracing::info!(
                    "📤 Posting {} points of {}",
                    batch.metrics.len(),
                    batch.metric_type
                );
                self.observe.post_metrics(batch).await?;
                batches_posted += 1;
                points_posted += batch.metrics.len();
            }
        }

        let audit_path = if self.config.audit_enabled() {
            let path = self.write_audit_bundle(&result, ctx).await?;
            tracing::info!("💾 Audit bundle saved to: {}", path);
            Some(path)
        } else {
            None
        };

        Ok(LoadOutcome {
            batches_posted,
            points_posted,
            audit_path,
            dry_run: self.config.dry_run(),
        })
    }

    fn dry_run(&self) -> bool {
        self.config.dry_run()
    }
}
