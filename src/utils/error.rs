use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value for {field} ('{value}'): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Observe API returned status {status}: {body}")]
    ObserveApiError { status: u16, body: String },

    #[error("Snowflake statement failed (status {status}, code {code}): {message}")]
    WarehouseError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("{operation} timed out after {seconds}s")]
    TimeoutError { operation: String, seconds: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// 警告性質，流程仍算成功
    Low,
    /// 暫時性錯誤，重試可能恢復
    Medium,
    /// 處理錯誤，需要人工介入
    High,
    /// 系統層級錯誤
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Warehouse,
    Config,
    Data,
    System,
}

impl EtlError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EtlError::ApiError(_) | EtlError::TimeoutError { .. } => ErrorSeverity::Medium,
            // 429/5xx 屬暫時性，其餘視為請求本身有問題
            EtlError::ObserveApiError { status, .. } => {
                if *status == 429 || *status >= 500 {
                    ErrorSeverity::Medium
                } else {
                    ErrorSeverity::High
                }
            }
            // Snowflake 端同樣以 429/5xx 為暫時性，其餘是語句或權限問題
            EtlError::WarehouseError { status, .. } => {
                if *status == 429 || *status >= 500 {
                    ErrorSeverity::Medium
                } else {
                    ErrorSeverity::High
                }
            }
            EtlError::ConfigError { .. }
            | EtlError::MissingConfigError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::ProcessingError { .. }
            | EtlError::ValidationError { .. }
            | EtlError::SerializationError(_)
            | EtlError::CsvError(_) => ErrorSeverity::High,
            EtlError::IoError(_) | EtlError::ZipError(_) => ErrorSeverity::Critical,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ApiError(_)
            | EtlError::ObserveApiError { .. }
            | EtlError::TimeoutError { .. } => ErrorCategory::Network,
            EtlError::WarehouseError { .. } => ErrorCategory::Warehouse,
            EtlError::ConfigError { .. }
            | EtlError::MissingConfigError { .. }
            | EtlError::InvalidConfigValueError { .. } => ErrorCategory::Config,
            EtlError::ProcessingError { .. }
            | EtlError::ValidationError { .. }
            | EtlError::SerializationError(_)
            | EtlError::CsvError(_) => ErrorCategory::Data,
            EtlError::IoError(_) | EtlError::ZipError(_) => ErrorCategory::System,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.severity() == ErrorSeverity::Medium
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            EtlError::ApiError(_) => {
                "Check network connectivity and API base URLs, then retry".to_string()
            }
            EtlError::ObserveApiError { status, .. } => match status {
                401 | 403 => "Verify the auth token and organization id".to_string(),
                429 => "The API is rate limiting; wait for the next scheduled run".to_string(),
                _ if *status >= 500 => {
                    "The Observe API is having trouble; the run will be retried".to_string()
                }
                _ => "Inspect the request parameters against the API documentation".to_string(),
            },
            EtlError::WarehouseError { status, code, .. } => match status {
                429 => "Snowflake is rate limiting; wait for the next scheduled run".to_string(),
                _ if *status >= 500 => {
                    "Snowflake is having trouble; the run will be retried".to_string()
                }
                _ => format!(
                    "Check the Snowflake token, role and warehouse grants (error code {})",
                    code
                ),
            },
            EtlError::ConfigError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. } => {
                "Fix the configuration file or the environment variables and restart".to_string()
            }
            EtlError::ProcessingError { .. } | EtlError::ValidationError { .. } => {
                "Inspect the offending records in the logs".to_string()
            }
            EtlError::SerializationError(_) | EtlError::CsvError(_) => {
                "The upstream payload shape changed; check for API updates".to_string()
            }
            EtlError::IoError(_) | EtlError::ZipError(_) => {
                "Check disk space and permissions on the output path".to_string()
            }
            EtlError::TimeoutError { .. } => {
                "Increase the timeout or reduce the query window".to_string()
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            EtlError::ApiError(_) => "Could not reach the API".to_string(),
            EtlError::ObserveApiError { status, .. } => {
                format!("The Observe API rejected the request (HTTP {})", status)
            }
            EtlError::WarehouseError { .. } => "The Snowflake query failed".to_string(),
            EtlError::ConfigError { message } => format!("Configuration problem: {}", message),
            EtlError::MissingConfigError { field } => {
                format!("Required configuration '{}' is not set", field)
            }
            EtlError::InvalidConfigValueError { field, reason, .. } => {
                format!("Configuration '{}' is invalid: {}", field, reason)
            }
            EtlError::ProcessingError { message } => {
                format!("Data processing failed: {}", message)
            }
            EtlError::ValidationError { message } => format!("Validation failed: {}", message),
            EtlError::SerializationError(_) => "Unexpected payload format".to_string(),
            EtlError::CsvError(_) => "Could not render the audit CSV".to_string(),
            EtlError::IoError(_) => "A file operation failed".to_string(),
            EtlError::ZipError(_) => "Could not build the audit archive".to_string(),
            EtlError::TimeoutError { operation, seconds } => {
                format!("{} did not finish within {}s", operation, seconds)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
