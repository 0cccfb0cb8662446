use chrono::TimeDelta;
use clap::Parser;
use cost_attribution_etl::domain::model::{RunContext, RunReport, RunWindow};
use cost_attribution_etl::utils::error::ErrorSeverity;
use cost_attribution_etl::utils::{logger, validation::Validate};
use cost_attribution_etl::{
    AttributionConfig, AttributionPipeline, CliConfig, EtlEngine, LocalStorage, ObserveClient,
    Scheduler, SnowflakeClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.log_json {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting cost-attribution-etl CLI");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    // 驗證命令列參數
    if let Err(e) = cli.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    // 載入配置（TOML 檔或環境變數）
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Configuration validation failed: {}", e);
            tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());
            std::process::exit(1);
        }
    };

    let monitor_enabled = cli.monitor || config.monitoring_enabled();
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }
    if cli.dry_run {
        tracing::info!("⏭️ Dry-run mode: metrics will not be posted");
    }

    match run(&cli, &config, monitor_enabled).await {
        Ok(()) => {
            tracing::info!("✅ Attribution process completed successfully!");
        }
        Err(e) => {
            // 記錄詳細錯誤信息
            tracing::error!(
                "❌ Attribution process failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            // 輸出用戶友好的錯誤信息
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,      // 警告，但成功
                ErrorSeverity::Medium => 2,   // 重試錯誤
                ErrorSeverity::High => 1,     // 處理錯誤
                ErrorSeverity::Critical => 3, // 系統錯誤
            };

            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}

fn load_config(cli: &CliConfig) -> cost_attribution_etl::Result<AttributionConfig> {
    let config = match &cli.config {
        Some(path) => {
            tracing::info!("📋 Loading configuration from: {}", path);
            AttributionConfig::from_file(path)?
        }
        None => AttributionConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

async fn run(
    cli: &CliConfig,
    config: &AttributionConfig,
    monitor_enabled: bool,
) -> cost_attribution_etl::Result<()> {
    let observe = ObserveClient::new(config.observe_settings());
    let warehouse = SnowflakeClient::new(config.warehouse_settings()?);

    let output_root = cli
        .output_path
        .clone()
        .unwrap_or_else(|| config.output_path().to_string());
    let storage = LocalStorage::new(&output_root);

    let pipeline = AttributionPipeline::new(
        observe,
        warehouse,
        storage,
        config.pipeline_options(cli.dry_run),
    );
    let engine = EtlEngine::new_with_monitoring(pipeline, monitor_enabled);

    if cli.schedule {
        let scheduler = Scheduler::new(engine, config.interval_minutes(), config.retry_policy());
        return scheduler.run_forever().await;
    }

    // 單次執行：預設取當前整點視窗，手動指定邊界時優先
    let interval = config.interval_minutes();
    let window = match cli.manual_window(interval)? {
        Some(window) => window,
        None => RunWindow::current(TimeDelta::minutes(interval))?,
    };
    let ctx = match &cli.execution_id {
        Some(id) => RunContext::with_execution_id(id.clone(), window),
        None => RunContext::for_window(window),
    };

    let report = engine.run(&ctx).await?;

    if config.export_metrics() {
        export_report(&output_root, &report).await?;
    }

    if report.short_circuited {
        println!("⏭️ No external queries in window {}", report.window);
    } else {
        println!(
            "✅ Attribution run {} posted {} batches ({} points)",
            report.execution_id, report.batches_posted, report.points_posted
        );
    }

    Ok(())
}

async fn export_report(output_root: &str, report: &RunReport) -> cost_attribution_etl::Result<()> {
    let path =
        std::path::Path::new(output_root).join(format!("{}_report.json", report.execution_id));
    let json = serde_json::to_string_pretty(report)?;

    tokio::fs::create_dir_all(output_root).await?;
    tokio::fs::write(&path, json).await?;

    tracing::info!("📁 Run report saved to: {}", path.display());
    Ok(())
}
