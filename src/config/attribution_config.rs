use crate::core::observe_api::ObserveSettings;
use crate::core::snowflake::{TokenType, WarehouseSettings};
use crate::domain::ports::ConfigProvider;
use crate::utils::error::{EtlError, Result};
use crate::utils::retry::RetryPolicy;
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_ORGANIZATION_ID: &str = "ASTRO_ORGANIZATION_ID";
pub const ENV_AUTH_TOKEN: &str = "ASTRO_AUTH_TOKEN";
/// 舊部署把 token 放在 Airflow 變數裡，仍然接受
pub const ENV_AUTH_TOKEN_FALLBACK: &str = "AIRFLOW_VAR_AUTH_TOKEN";
pub const ENV_API_BASE_URL: &str = "ASTRO_API_BASE_URL";
pub const ENV_SNOWFLAKE_BASE_URL: &str = "SNOWFLAKE_BASE_URL";
pub const ENV_SNOWFLAKE_ACCOUNT: &str = "SNOWFLAKE_ACCOUNT";
pub const ENV_SNOWFLAKE_TOKEN: &str = "SNOWFLAKE_TOKEN";
pub const ENV_SNOWFLAKE_TOKEN_TYPE: &str = "SNOWFLAKE_TOKEN_TYPE";
pub const ENV_SNOWFLAKE_WAREHOUSE: &str = "SNOWFLAKE_WAREHOUSE";
pub const ENV_SNOWFLAKE_ROLE: &str = "SNOWFLAKE_ROLE";

const DEFAULT_LAG_HOURS: i64 = 8;
const DEFAULT_INTERVAL_MINUTES: i64 = 60;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_SECONDS: u64 = 60;
const DEFAULT_OUTPUT_PATH: &str = "./output";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    pub pipeline: PipelineInfo,
    pub observe: ObserveConfig,
    pub warehouse: WarehouseConfig,
    pub schedule: Option<ScheduleConfig>,
    pub attribution: Option<AttributionTuning>,
    pub load: Option<LoadConfig>,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub name: String,
    pub description: String,
    pub version: String,
}

impl Default for PipelineInfo {
    fn default() -> Self {
        Self {
            name: "cost-attribution".to_string(),
            description: "Attributes Snowflake credits and query stats to tasks".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveConfig {
    pub organization_id: String,
    pub auth_token: String,
    pub base_url: Option<String>,
    pub client_identifier: Option<String>,
    pub request_timeout_seconds: Option<u64>,
    pub post_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub token: String,
    /// 與 account 擇一
    pub base_url: Option<String>,
    pub account: Option<String>,
    pub token_type: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub statement_timeout_seconds: Option<u64>,
    pub poll_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_minutes: Option<i64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionTuning {
    pub lag_hours: Option<i64>,
    pub include_usage_metrics: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub output_path: Option<String>,
    pub audit_enabled: Option<bool>,
    pub audit_formats: Option<Vec<String>>,
    pub audit_include_metadata: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub export_metrics: Option<bool>,
}

impl AttributionConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| EtlError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${ASTRO_ORGANIZATION_ID})
    fn substitute_env_vars(content: &str) -> String {
        use regex::Regex;
        // 使用正規表達式匹配 ${VAR_NAME} 格式
        let re = match Regex::new(r"\$\{([^}]+)\}") {
            Ok(re) => re,
            Err(_) => return content.to_string(),
        };

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        })
        .to_string()
    }

    /// 純環境變數組裝，不需要配置檔
    pub fn from_env() -> Result<Self> {
        Self::check_required_env()?;

        let auth_token = std::env::var(ENV_AUTH_TOKEN)
            .or_else(|_| std::env::var(ENV_AUTH_TOKEN_FALLBACK))
            .unwrap_or_default();

        Ok(Self {
            pipeline: PipelineInfo::default(),
            observe: ObserveConfig {
                organization_id: std::env::var(ENV_ORGANIZATION_ID).unwrap_or_default(),
                auth_token,
                base_url: std::env::var(ENV_API_BASE_URL).ok(),
                client_identifier: None,
                request_timeout_seconds: None,
                post_timeout_seconds: None,
            },
            warehouse: WarehouseConfig {
                token: std::env::var(ENV_SNOWFLAKE_TOKEN).unwrap_or_default(),
                base_url: std::env::var(ENV_SNOWFLAKE_BASE_URL).ok(),
                account: std::env::var(ENV_SNOWFLAKE_ACCOUNT).ok(),
                token_type: std::env::var(ENV_SNOWFLAKE_TOKEN_TYPE).ok(),
                warehouse: std::env::var(ENV_SNOWFLAKE_WAREHOUSE).ok(),
                role: std::env::var(ENV_SNOWFLAKE_ROLE).ok(),
                statement_timeout_seconds: None,
                poll_interval_seconds: None,
            },
            schedule: None,
            attribution: None,
            load: None,
            monitoring: None,
        })
    }

    /// 檢查必要環境變數，缺的一次列完
    pub fn check_required_env() -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();

        if std::env::var(ENV_ORGANIZATION_ID).is_err() {
            missing.push(ENV_ORGANIZATION_ID);
        }
        if std::env::var(ENV_AUTH_TOKEN).is_err()
            && std::env::var(ENV_AUTH_TOKEN_FALLBACK).is_err()
        {
            missing.push(ENV_AUTH_TOKEN);
        }
        if std::env::var(ENV_SNOWFLAKE_BASE_URL).is_err()
            && std::env::var(ENV_SNOWFLAKE_ACCOUNT).is_err()
        {
            missing.push(ENV_SNOWFLAKE_BASE_URL);
        }
        if std::env::var(ENV_SNOWFLAKE_TOKEN).is_err() {
            missing.push(ENV_SNOWFLAKE_TOKEN);
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EtlError::ConfigError {
                message: format!(
                    "Missing required environment variables: {}",
                    missing.join(", ")
                ),
            })
        }
    }

    pub fn observe_settings(&self) -> ObserveSettings {
        let mut settings = ObserveSettings::new(
            self.observe.organization_id.clone(),
            self.observe.auth_token.clone(),
        );
        if let Some(base_url) = &self.observe.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(identifier) = &self.observe.client_identifier {
            settings.client_identifier = identifier.clone();
        }
        if let Some(secs) = self.observe.request_timeout_seconds {
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.observe.post_timeout_seconds {
            settings.post_timeout = Duration::from_secs(secs);
        }
        settings.retry = self.retry_policy();
        settings
    }

    pub fn warehouse_settings(&self) -> Result<WarehouseSettings> {
        let mut settings = match (&self.warehouse.base_url, &self.warehouse.account) {
            (Some(base_url), _) => {
                WarehouseSettings::new(base_url.clone(), self.warehouse.token.clone())
            }
            (None, Some(account)) => {
                WarehouseSettings::for_account(account, self.warehouse.token.clone())
            }
            (None, None) => {
                return Err(EtlError::MissingConfigError {
                    field: "warehouse.base_url or warehouse.account".to_string(),
                })
            }
        };

        if let Some(token_type) = &self.warehouse.token_type {
            settings.token_type = TokenType::parse(token_type)?;
        }
        settings.warehouse = self.warehouse.warehouse.clone();
        settings.role = self.warehouse.role.clone();
        if let Some(secs) = self.warehouse.statement_timeout_seconds {
            settings.statement_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.warehouse.poll_interval_seconds {
            settings.poll_interval = Duration::from_secs(secs);
        }
        settings.retry = self.retry_policy();
        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let schedule = self.schedule.as_ref();
        RetryPolicy::new(
            schedule
                .and_then(|s| s.retry_attempts)
                .unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            Duration::from_secs(
                schedule
                    .and_then(|s| s.retry_delay_seconds)
                    .unwrap_or(DEFAULT_RETRY_DELAY_SECONDS),
            ),
        )
    }

    pub fn interval_minutes(&self) -> i64 {
        self.schedule
            .as_ref()
            .and_then(|s| s.interval_minutes)
            .unwrap_or(DEFAULT_INTERVAL_MINUTES)
    }

    pub fn lag_hours(&self) -> i64 {
        self.attribution
            .as_ref()
            .and_then(|a| a.lag_hours)
            .unwrap_or(DEFAULT_LAG_HOURS)
    }

    pub fn output_path(&self) -> &str {
        self.load
            .as_ref()
            .and_then(|l| l.output_path.as_deref())
            .unwrap_or(DEFAULT_OUTPUT_PATH)
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn export_metrics(&self) -> bool {
        self.monitoring
            .as_ref()
            .and_then(|m| m.export_metrics)
            .unwrap_or(false)
    }

    /// 把配置收斂成 pipeline 需要的選項
    pub fn pipeline_options(&self, dry_run: bool) -> PipelineOptions {
        let load = self.load.as_ref();
        PipelineOptions {
            attribution_lag_hours: self.lag_hours(),
            include_usage_metrics: self
                .attribution
                .as_ref()
                .and_then(|a| a.include_usage_metrics)
                .unwrap_or(true),
            audit_enabled: load.and_then(|l| l.audit_enabled).unwrap_or(true),
            audit_formats: load
                .and_then(|l| l.audit_formats.clone())
                .unwrap_or_else(|| vec!["json".to_string(), "csv".to_string()]),
            audit_include_metadata: load
                .and_then(|l| l.audit_include_metadata)
                .unwrap_or(false),
            dry_run,
        }
    }

    fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_string(
            "observe.organization_id",
            &self.observe.organization_id,
        )?;
        validation::validate_non_empty_string("observe.auth_token", &self.observe.auth_token)?;
        validation::validate_non_empty_string("warehouse.token", &self.warehouse.token)?;

        if let Some(base_url) = &self.observe.base_url {
            validation::validate_url("observe.base_url", base_url)?;
        }
        if let Some(base_url) = &self.warehouse.base_url {
            validation::validate_url("warehouse.base_url", base_url)?;
        }
        if self.warehouse.base_url.is_none() && self.warehouse.account.is_none() {
            return Err(EtlError::MissingConfigError {
                field: "warehouse.base_url or warehouse.account".to_string(),
            });
        }
        if let Some(token_type) = &self.warehouse.token_type {
            TokenType::parse(token_type)?;
        }

        if let Some(schedule) = &self.schedule {
            if let Some(minutes) = schedule.interval_minutes {
                validation::validate_range("schedule.interval_minutes", minutes, 1, 1440)?;
            }
            if let Some(attempts) = schedule.retry_attempts {
                validation::validate_range("schedule.retry_attempts", attempts, 0, 10)?;
            }
        }
        if let Some(attribution) = &self.attribution {
            if let Some(lag) = attribution.lag_hours {
                validation::validate_range("attribution.lag_hours", lag, 0, 48)?;
            }
        }
        if let Some(load) = &self.load {
            if let Some(output_path) = &load.output_path {
                validation::validate_path("load.output_path", output_path)?;
            }
            if let Some(formats) = &load.audit_formats {
                validation::validate_output_formats("load.audit_formats", formats)?;
            }
        }

        Ok(())
    }
}

impl Validate for AttributionConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

/// Pipeline-facing view of the configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub attribution_lag_hours: i64,
    pub include_usage_metrics: bool,
    pub audit_enabled: bool,
    pub audit_formats: Vec<String>,
    pub audit_include_metadata: bool,
    pub dry_run: bool,
}

impl ConfigProvider for PipelineOptions {
    fn attribution_lag_hours(&self) -> i64 {
        self.attribution_lag_hours
    }

    fn include_usage_metrics(&self) -> bool {
        self.include_usage_metrics
    }

    fn audit_enabled(&self) -> bool {
        self.audit_enabled
    }

    fn audit_formats(&self) -> &[String] {
        &self.audit_formats
    }

    fn audit_include_metadata(&self) -> bool {
        self.audit_include_metadata
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[pipeline]
name = "cost-attribution"
description = "test"
version = "1.0.0"

[observe]
organization_id = "org-123"
auth_token = "token-abc"

[warehouse]
token = "sf-token"
account = "acme-prod"
"#;

    #[test]
    fn test_parse_minimal_toml_config() {
        let config = AttributionConfig::from_toml_str(MINIMAL_TOML).unwrap();

        assert_eq!(config.pipeline.name, "cost-attribution");
        assert_eq!(config.observe.organization_id, "org-123");
        assert_eq!(config.interval_minutes(), 60);
        assert_eq!(config.lag_hours(), 8);
        assert_eq!(config.output_path(), "./output");
        assert!(config.validate().is_ok());

        let retry = config.retry_policy();
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.delay, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_full_toml_config() {
        let toml_content = r#"
[pipeline]
name = "cost-attribution"
description = "test"
version = "1.0.0"

[observe]
organization_id = "org-123"
auth_token = "token-abc"
base_url = "https://api.dev.example.io/private/v1alpha1"
post_timeout_seconds = 120

[warehouse]
token = "sf-token"
base_url = "https://acme.snowflakecomputing.com"
token_type = "KEYPAIR_JWT"
warehouse = "REPORTING_WH"
role = "COST_READER"

[schedule]
interval_minutes = 30
retry_attempts = 5
retry_delay_seconds = 10

[attribution]
lag_hours = 12
include_usage_metrics = false

[load]
output_path = "./audit"
audit_formats = ["csv"]

[monitoring]
enabled = true
export_metrics = true
"#;

        let config = AttributionConfig::from_toml_str(toml_content).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.interval_minutes(), 30);
        assert_eq!(config.lag_hours(), 12);
        assert!(config.monitoring_enabled());
        assert!(config.export_metrics());

        let observe = config.observe_settings();
        assert_eq!(observe.base_url, "https://api.dev.example.io/private/v1alpha1");
        assert_eq!(observe.post_timeout, Duration::from_secs(120));
        assert_eq!(observe.retry.attempts, 5);

        let warehouse = config.warehouse_settings().unwrap();
        assert_eq!(warehouse.base_url, "https://acme.snowflakecomputing.com");
        assert_eq!(warehouse.token_type.header_value(), "KEYPAIR_JWT");
        assert_eq!(warehouse.warehouse.as_deref(), Some("REPORTING_WH"));

        let options = config.pipeline_options(true);
        assert!(!options.include_usage_metrics());
        assert!(options.dry_run());
        assert_eq!(options.audit_formats(), &["csv".to_string()]);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("COST_ATTR_TEST_ORG", "org-from-env");

        let toml_content = r#"
[pipeline]
name = "cost-attribution"
description = "test"
version = "1.0.0"

[observe]
organization_id = "${COST_ATTR_TEST_ORG}"
auth_token = "token"

[warehouse]
token = "sf-token"
account = "acme"
"#;

        let config = AttributionConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.observe.organization_id, "org-from-env");

        std::env::remove_var("COST_ATTR_TEST_ORG");
    }

    #[test]
    fn test_unset_env_var_is_left_verbatim() {
        let content = "value = \"${COST_ATTR_TEST_NOT_SET}\"";
        let substituted = AttributionConfig::substitute_env_vars(content);
        assert_eq!(substituted, content);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AttributionConfig::from_toml_str(MINIMAL_TOML).unwrap();

        config.observe.base_url = Some("not-a-url".to_string());
        assert!(config.validate().is_err());

        config.observe.base_url = None;
        config.schedule = Some(ScheduleConfig {
            interval_minutes: Some(0),
            retry_attempts: None,
            retry_delay_seconds: None,
        });
        assert!(config.validate().is_err());

        config.schedule = None;
        config.warehouse.token_type = Some("password".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warehouse_requires_base_url_or_account() {
        let mut config = AttributionConfig::from_toml_str(MINIMAL_TOML).unwrap();
        config.warehouse.account = None;

        assert!(config.validate().is_err());
        assert!(matches!(
            config.warehouse_settings(),
            Err(EtlError::MissingConfigError { .. })
        ));
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(MINIMAL_TOML.as_bytes()).unwrap();

        let config = AttributionConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.observe.organization_id, "org-123");
    }

    #[test]
    fn test_env_assembly_and_missing_var_collection() {
        // 同一組環境變數的兩種情境放同一個測試，避免平行測試互踩
        std::env::remove_var(ENV_ORGANIZATION_ID);
        std::env::remove_var(ENV_AUTH_TOKEN);
        std::env::remove_var(ENV_AUTH_TOKEN_FALLBACK);
        std::env::remove_var(ENV_SNOWFLAKE_BASE_URL);
        std::env::remove_var(ENV_SNOWFLAKE_ACCOUNT);
        std::env::remove_var(ENV_SNOWFLAKE_TOKEN);

        let err = AttributionConfig::from_env().unwrap_err();
        let message = err.to_string();
        assert!(message.contains(ENV_ORGANIZATION_ID));
        assert!(message.contains(ENV_AUTH_TOKEN));
        assert!(message.contains(ENV_SNOWFLAKE_BASE_URL));
        assert!(message.contains(ENV_SNOWFLAKE_TOKEN));

        std::env::set_var(ENV_ORGANIZATION_ID, "org-env");
        // token 只給 Airflow 變數名，fallback 要生效
        std::env::set_var(ENV_AUTH_TOKEN_FALLBACK, "token-env");
        std::env::set_var(ENV_SNOWFLAKE_ACCOUNT, "acme-env");
        std::env::set_var(ENV_SNOWFLAKE_TOKEN, "sf-env");

        let config = AttributionConfig::from_env().unwrap();
        assert_eq!(config.observe.organization_id, "org-env");
        assert_eq!(config.observe.auth_token, "token-env");
        assert_eq!(config.warehouse.account.as_deref(), Some("acme-env"));
        assert!(config.validate().is_ok());

        let warehouse = config.warehouse_settings().unwrap();
        assert_eq!(
            warehouse.base_url,
            "https://acme-env.snowflakecomputing.com"
        );

        std::env::remove_var(ENV_ORGANIZATION_ID);
        std::env::remove_var(ENV_AUTH_TOKEN_FALLBACK);
        std::env::remove_var(ENV_SNOWFLAKE_ACCOUNT);
        std::env::remove_var(ENV_SNOWFLAKE_TOKEN);
    }
}
