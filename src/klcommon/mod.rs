// 导出共享模块
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod interval;
pub mod logging_setup;
pub mod models;

// 重新导出常用类型，方便使用
pub use api::{BinanceApi, MarketFeed};
pub use config::{
    DatabaseConfig, DispatcherConfig, FeedConfig, LoggingConfig, PipelineConfig, RollupConfig, ScheduleConfig,
    StreamerConfig,
};
pub use db::{CandleStore, Database};
pub use error::{AppError, Result};
pub use interval::Interval;
pub use models::{Candle, ExchangeInfo, ExchangeSymbol, KlineData, KlineEvent, PartitionKey, RawKline, Symbol};
