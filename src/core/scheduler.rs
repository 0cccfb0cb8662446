use crate::core::etl::EtlEngine;
use crate::domain::model::{RunContext, RunReport, RunWindow};
use crate::domain::ports::Pipeline;
use crate::utils::error::Result;
use crate::utils::retry::{with_retries, RetryPolicy};
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

pub struct Scheduler<P: Pipeline> {
    engine: EtlEngine<P>,
    interval: TimeDelta,
    retry: RetryPolicy,
}

impl<P: Pipeline> Scheduler<P> {
    pub fn new(engine: EtlEngine<P>, interval_minutes: i64, retry: RetryPolicy) -> Self {
        Self {
            engine,
            interval: TimeDelta::minutes(interval_minutes),
            retry,
        }
    }

    /// One window with the per-run retry budget applied.
    pub async fn run_once(&self, ctx: &RunContext) -> Result<RunReport> {
        with_retries(self.retry, "Attribution run", || self.engine.run(ctx)).await
    }

    /// 常駐模式：每個區間跑一次。失敗只記錄不中斷，漏掉的區間不回補，
    /// 視窗永遠依目前牆上時鐘計算
    pub async fn run_forever(&self) -> Result<()> {
        tracing::info!(
            "📡 Scheduler started ({} minute interval)",
            self.interval.num_minutes()
        );

        loop {
            let window = RunWindow::current(self.interval)?;
            let ctx = RunContext::for_window(window);

            match self.run_once(&ctx).await {
                Ok(report) if report.short_circuited => {
                    tracing::info!("⏭️ Run {} had nothing to attribute", report.execution_id);
                }
                Ok(report) => {
                    tracing::info!(
                        "✅ Run {} posted {} points",
                        report.execution_id,
                        report.points_posted
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Run {} failed: {} (Category: {:?}, Severity: {:?})",
                        ctx.execution_id,
                        e,
                        e.category(),
                        e.severity()
                    );
                    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
                }
            }

            let next_boundary = window.end + self.interval;
            let sleep_for = delay_until(next_boundary, Utc::now());
            tracing::info!("📡 Next run at {}", next_boundary);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("✅ Shutdown signal received, stopping scheduler");
                    return Ok(());
                }
            }
        }
    }
}

fn delay_until(next_boundary: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    // 已過期的邊界直接跑下一輪
    (next_boundary - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{AttributionResult, ExtractBatch, LoadOutcome};
    use crate::utils::error::EtlError;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyPipeline {
        attempts: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait::async_trait]
    impl Pipeline for FlakyPipeline {
        async fn extract(&self, ctx: &RunContext) -> Result<ExtractBatch> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(EtlError::ObserveApiError {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(ExtractBatch::empty(ctx.window))
        }

        async fn transform(
            &self,
            _batch: ExtractBatch,
            _ctx: &RunContext,
        ) -> Result<AttributionResult> {
            unreachable!("empty batch short-circuits before transform")
        }

        async fn load(
            &self,
            _result: AttributionResult,
            _ctx: &RunContext,
        ) -> Result<LoadOutcome> {
            unreachable!("empty batch short-circuits before load")
        }
    }

    fn test_context() -> RunContext {
        let window = RunWindow::from_bounds(
            Utc.with_ymd_and_hms(2024, 11, 1, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 11, 1, 10, 0, 0).unwrap(),
        )
        .unwrap();
        RunContext::for_window(window)
    }

    #[tokio::test]
    async fn test_run_once_retries_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let pipeline = FlakyPipeline {
            attempts: attempts.clone(),
            fail_first: 2,
        };
        let scheduler = Scheduler::new(
            EtlEngine::new(pipeline),
            60,
            RetryPolicy::new(3, Duration::from_millis(1)),
        );

        let report = scheduler.run_once(&test_context()).await.unwrap();

        assert!(report.short_circuited);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_once_gives_up_after_retry_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let pipeline = FlakyPipeline {
            attempts: attempts.clone(),
            fail_first: u32::MAX,
        };
        let scheduler = Scheduler::new(
            EtlEngine::new(pipeline),
            60,
            RetryPolicy::new(1, Duration::from_millis(1)),
        );

        let result = scheduler.run_once(&test_context()).await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delay_until_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 11, 1, 10, 59, 0).unwrap();
        let boundary = Utc.with_ymd_and_hms(2024, 11, 1, 11, 0, 0).unwrap();
        assert_eq!(delay_until(boundary, now), Duration::from_secs(60));

        // 邊界已過：不等待
        let late = Utc.with_ymd_and_hms(2024, 11, 1, 11, 5, 0).unwrap();
        assert_eq!(delay_until(boundary, late), Duration::ZERO);
    }
}
