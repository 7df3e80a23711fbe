//! K线采集与聚合流水线配置模块

use crate::klcommon::{AppError, Interval, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/PipelineConfig.toml";

fn default_exchange() -> String {
    "Binance".to_string()
}

/// 流水线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 写入交易对与K线时使用的交易所名称
    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub streamer: StreamerConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 行情源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// REST 接口地址
    pub rest_url: String,

    /// WebSocket 推送地址
    pub ws_url: String,

    /// 可选代理，例如 socks5://127.0.0.1:1080
    pub proxy_url: Option<String>,

    /// 请求超时（秒）
    pub request_timeout_secs: u64,

    /// 连接超时（秒）
    pub connect_timeout_secs: u64,

    /// 每次采集拉取的最近K线根数，至少为2，保证当前未收盘K线之外还有一根已收盘的
    pub collect_limit: usize,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,
}

/// 任务分发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 工作池同时执行的任务上限
    pub concurrency: usize,

    /// 关闭时等待在途任务完成的时间（秒），超时后取消剩余任务
    pub shutdown_grace_secs: u64,
}

/// 实时推送采集配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// 首次重连等待（毫秒）
    pub initial_backoff_ms: u64,

    /// 重连等待上限（毫秒）
    pub max_backoff_ms: u64,

    /// 连续失败次数上限，None 表示无限重连
    pub max_consecutive_failures: Option<u32>,
}

/// 一级聚合：source -> target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    pub source: String,
    pub target: String,
}

/// 定时调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// 原始K线的采集周期
    pub collect_interval: String,

    /// 周期边界之后再等待的时间（毫秒），给上游收盘留出余量
    pub settle_delay_ms: u64,

    /// 按顺序执行的聚合层级
    pub rollups: Vec<RollupConfig>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    pub log_level: String,

    /// 滚动日志文件目录
    pub log_dir: String,

    /// 是否启用控制台输出
    pub enable_console_output: bool,

    /// 文件日志是否使用 JSON 格式
    pub json_format: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.binance.com".to_string(),
            ws_url: "wss://stream.binance.com:9443".to_string(),
            proxy_url: None,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            collect_limit: 3,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "data/klines.db".to_string(),
            pool_size: 10,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            max_consecutive_failures: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            collect_interval: "1m".to_string(),
            settle_delay_ms: 2_000,
            rollups: vec![
                RollupConfig { source: "1m".to_string(), target: "1h".to_string() },
                RollupConfig { source: "1h".to_string(), target: "1d".to_string() },
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            enable_console_output: true,
            json_format: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            feed: FeedConfig::default(),
            database: DatabaseConfig::default(),
            dispatcher: DispatcherConfig::default(),
            streamer: StreamerConfig::default(),
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 文本解析并校验配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 按 `--config` > `CONFIG_PATH` > 默认路径的顺序加载
    ///
    /// 显式指定的路径（参数或环境变量）不存在时报错；只有默认路径缺失时才使用默认配置
    pub fn load(explicit_path: Option<&str>) -> Result<Self> {
        Self::load_with_env(explicit_path, std::env::var("CONFIG_PATH").ok())
    }

    /// `load` 的实现，环境变量由调用方传入
    pub fn load_with_env(explicit_path: Option<&str>, env_path: Option<String>) -> Result<Self> {
        let (path, explicit) = match (explicit_path, env_path) {
            (Some(p), _) => (p.to_string(), true),
            (None, Some(p)) => (p, true),
            (None, None) => (DEFAULT_CONFIG_PATH.to_string(), false),
        };

        if Path::new(&path).exists() {
            Self::from_file(&path)
        } else if explicit {
            Err(AppError::ConfigError(format!("配置文件不存在: {}", path)))
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.exchange.trim().is_empty() {
            return Err(AppError::ConfigError("交易所名称不能为空".to_string()));
        }

        if self.feed.collect_limit < 2 {
            return Err(AppError::ConfigError(
                "collect_limit 至少为2，否则无法保证拿到已收盘的K线".to_string(),
            ));
        }

        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        if self.dispatcher.concurrency == 0 {
            return Err(AppError::ConfigError("工作池并发数必须大于0".to_string()));
        }

        if self.streamer.initial_backoff_ms == 0 || self.streamer.max_backoff_ms < self.streamer.initial_backoff_ms {
            return Err(AppError::ConfigError(
                "重连等待必须满足 0 < initial_backoff_ms <= max_backoff_ms".to_string(),
            ));
        }

        Interval::parse(&self.schedule.collect_interval)?;
        for rollup in &self.schedule.rollups {
            let (source, target) = rollup.intervals()?;
            target.ratio_to(&source)?;
        }

        Ok(())
    }
}

impl RollupConfig {
    pub fn intervals(&self) -> Result<(Interval, Interval)> {
        Ok((Interval::parse(&self.source)?, Interval::parse(&self.target)?))
    }
}
