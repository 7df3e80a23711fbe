//! 日志系统初始化模块
//!
//! 控制台输出 + 按天滚动的文件日志，文件写入走 non-blocking 通道，
//! 返回的 guard 必须由 main 持有到进程结束，否则尾部日志会丢失

use crate::klcommon::{LoggingConfig, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 构造业务日志过滤器：RUST_LOG 优先，否则使用配置中的级别，并压低第三方库噪音
pub fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,rusqlite=warn,tungstenite=warn,tokio_tungstenite=warn",
            log_level
        ))
    })
}

/// 初始化日志系统
pub fn init_logging(config: &LoggingConfig, file_prefix: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, format!("{}.log", file_prefix));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_target(true)
            .with_filter(build_filter(&config.log_level))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(build_filter(&config.log_level))
            .boxed()
    };

    let console_layer = config.enable_console_output.then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .with_filter(build_filter(&config.log_level))
    });

    if let Err(e) = Registry::default().with(file_layer).with(console_layer).try_init() {
        eprintln!("注意: tracing订阅器已存在: {}", e);
    }

    Ok(guard)
}
