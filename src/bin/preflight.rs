use anyhow::Context;
use chrono::TimeDelta;
use cost_attribution_etl::domain::model::RunWindow;
use cost_attribution_etl::domain::ports::ObserveApi;
use cost_attribution_etl::utils::validation::Validate;
use cost_attribution_etl::{AttributionConfig, ObserveClient, SnowflakeClient};

/// 部署前檢查：確認配置、Observe API 與倉儲三者都可用
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("🚀 Cost attribution preflight");

    // 第一個參數當 TOML 路徑，沒有就讀環境變數
    let config = match std::env::args().nth(1) {
        Some(path) => {
            println!("📋 Loading configuration from: {}", path);
            AttributionConfig::from_file(&path).with_context(|| format!("cannot load {}", path))?
        }
        None => AttributionConfig::from_env().context("environment configuration incomplete")?,
    };

    config.validate().context("configuration rejected")?;
    println!("✅ 配置驗證通過");

    let mut failures = 0;

    // Observe API：抓一個極小的視窗，確認認證與組織 id 有效
    let observe = ObserveClient::new(config.observe_settings());
    let probe_window = RunWindow::current(TimeDelta::minutes(1))
        .context("cannot derive a probe window")?
        .lagged(config.lag_hours());

    match observe.external_queries(&probe_window).await {
        Ok(queries) => {
            println!(
                "✅ Observe API reachable ({} queries in probe window)",
                queries.len()
            );
        }
        Err(e) => {
            println!("❌ Observe API check failed: {}", e);
            println!("💡 {}", e.recovery_suggestion());
            failures += 1;
        }
    }

    // 倉儲：select 1 確認 token 與 statements 端點可用
    let settings = config
        .warehouse_settings()
        .context("warehouse settings incomplete")?;
    let warehouse = SnowflakeClient::new(settings);

    match warehouse.execute("select 1").await {
        Ok(rows) => println!("✅ Warehouse reachable ({} row)", rows.len()),
        Err(e) => {
            println!("❌ Warehouse check failed: {}", e);
            println!("💡 {}", e.recovery_suggestion());
            failures += 1;
        }
    }

    if failures > 0 {
        println!("\n❌ Preflight failed: {} check(s) did not pass", failures);
        std::process::exit(1);
    }

    println!("\n🎉 Preflight passed, ready for scheduled runs.");
    Ok(())
}
