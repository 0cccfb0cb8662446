use crate::domain::model::{format_api_timestamp, RunContext, RunReport};
use crate::domain::ports::Pipeline;
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;
use std::time::Instant;

pub struct EtlEngine<P: Pipeline> {
    pipeline: P,
    monitor: SystemMonitor,
}

impl<P: Pipeline> EtlEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline,
            monitor: SystemMonitor::new(false),
        }
    }

    pub fn new_with_monitoring(pipeline: P, monitoring: bool) -> Self {
        Self {
            pipeline,
            monitor: SystemMonitor::new(monitoring),
        }
    }

    pub async fn run(&self, ctx: &RunContext) -> Result<RunReport> {
        let started = Instant::now();
        tracing::info!(
            "🚀 Starting attribution run {} ({} .. {})",
            ctx.execution_id,
            format_api_timestamp(ctx.window.start),
            format_api_timestamp(ctx.window.end)
        );

        // Extract
        tracing::info!("📥 Extracting query metadata and warehouse rows...");
        let batch = self.pipeline.extract(ctx).await?;
        self.monitor.log_stats("Extract");

        let external_queries = batch.queries.len();
        if batch.is_empty() {
            tracing::info!("⏭️ No external queries in window, skipping transform and load");
            self.monitor.log_final_stats();
            return Ok(RunReport {
                execution_id: ctx.execution_id.clone(),
                window: ctx.window,
                external_queries: 0,
                cost_points: 0,
                usage_points: 0,
                batches_posted: 0,
                points_posted: 0,
                skipped_unknown: 0,
                short_circuited: true,
                dry_run: self.pipeline.dry_run(),
                audit_path: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }
        tracing::info!(
            "📥 Extracted {} queries, {} cost rows, {} usage rows",
            external_queries,
            batch.costs.len(),
            batch.usage.len()
        );

        // Transform
        tracing::info!("🔄 Attributing warehouse rows to tasks...");
        let result = self.pipeline.transform(batch, ctx).await?;
        self.monitor.log_stats("Transform");
        tracing::info!(
            "🔄 Built {} metric batches ({} cost points, {} usage points)",
            result.batches.len(),
            result.cost_points,
            result.usage_points
        );
        if result.skipped_unknown > 0 {
            tracing::warn!(
                "🔶 {} warehouse rows had no matching metadata",
                result.skipped_unknown
            );
        }

        let cost_points = result.cost_points;
        let usage_points = result.usage_points;
        let skipped_unknown = result.skipped_unknown;

        // Load
        tracing::info!("📤 Posting metrics...");
        let outcome = self.pipeline.load(result, ctx).await?;
        self.monitor.log_stats("Load");

        let report = RunReport {
            execution_id: ctx.execution_id.clone(),
            window: ctx.window,
            external_queries,
            cost_points,
            usage_points,
            batches_posted: outcome.batches_posted,
            points_posted: outcome.points_posted,
            skipped_unknown,
            short_circuited: false,
            dry_run: outcome.dry_run,
            audit_path: outcome.audit_path,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            "🎉 Run {} finished: {} batches, {} points in {}ms",
            report.execution_id,
            report.batches_posted,
            report.points_posted,
            report.duration_ms
        );
        self.monitor.log_final_stats();

        Ok(report)
    }
}
