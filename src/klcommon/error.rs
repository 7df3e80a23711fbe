use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// 行情源不可达或返回非成功状态
    #[error("Fetch error: {0}")]
    FetchError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// 单品种采集过滤后没有任何可写入的已收盘K线
    #[error("Zero writes: {0}")]
    ZeroWritesError(String),

    /// 聚合窗口内的源K线不完整或不连续
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// 存储写入失败
    #[error("Persist error: {0}")]
    PersistError(String),

    /// 存储读取或连接池失败
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// 无法把任务提交到工作池
    #[error("Dispatch error: {0}")]
    DispatchError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Decimal parsing error: {0}")]
    DecimalError(#[from] rust_decimal::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，作为日志中的 `error.summary` 字段
    ///
    /// 返回稳定的业务分类字符串，便于按类别聚合日志
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            AppError::FetchError(_) => "kline_data_acquisition_failed",
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::JsonError(_) => "kline_data_parsing_failed",
            AppError::DecimalError(_) => "market_data_format_invalid",

            AppError::ZeroWritesError(_) => "kline_upstream_gap_detected",
            AppError::ValidationError(_) => "kline_window_not_consecutive",

            AppError::PersistError(_) => "kline_data_persistence_failed",
            AppError::DatabaseError(_) => "kline_storage_operation_failed",
            AppError::SqliteError(_) => "kline_storage_operation_failed",

            AppError::DispatchError(_) => "kline_job_dispatch_failed",
            AppError::Cancelled(_) => "kline_job_cancelled",

            AppError::WebSocketError(_) => "realtime_market_data_failed",
            AppError::UrlParseError(_) => "market_endpoint_invalid",

            AppError::IoError(_) => "kline_file_operation_failed",
            AppError::ConfigError(_) => "kline_service_configuration_invalid",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 网络抖动与存储锁争用可以在下一个调度周期重试；
    /// 数据校验、配置等错误重试也不会改变结果
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::FetchError(_) |
            AppError::HttpError(_) |
            AppError::WebSocketError(_) |
            AppError::IoError(_) => true,

            AppError::PersistError(msg) | AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            },
            AppError::SqliteError(_) => true,

            // 上游缺口可能在下一分钟被补齐
            AppError::ZeroWritesError(_) => true,

            AppError::ValidationError(_) |
            AppError::DispatchError(_) |
            AppError::ConfigError(_) |
            AppError::JsonError(_) |
            AppError::DecimalError(_) |
            AppError::UrlParseError(_) |
            AppError::Cancelled(_) => false,
        }
    }

    /// 是否属于行情获取失败（含传输层错误）
    pub fn is_fetch_error(&self) -> bool {
        matches!(self, AppError::FetchError(_) | AppError::HttpError(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
