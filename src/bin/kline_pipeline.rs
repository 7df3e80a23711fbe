// K线采集与聚合服务主程序
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Arg, ArgMatches, Command};
use kline_rollup::klcommon::logging_setup::init_logging;
use kline_rollup::klcommon::{
    AppError, BinanceApi, CandleStore, Database, Interval, MarketFeed, PipelineConfig, Symbol,
};
use kline_rollup::kldata::{
    CandleAggregator, CandleCollector, Dispatcher, JobRunner, KlineStreamer, ReconnectPolicy, Scheduler,
    SymbolRegistry, TungsteniteConnector, WorkerPool,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const LOG_TARGET: &str = "kline_pipeline";

fn cli() -> Command {
    Command::new("kline_pipeline")
        .about("K线采集、聚合与实时推送服务")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .help("配置文件路径，默认读取 CONFIG_PATH 或 config/PipelineConfig.toml"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("discover").about("登记行情源中的新交易对"))
        .subcommand(
            Command::new("collect")
                .about("为所有已知交易对分发一轮最近K线采集")
                .arg(Arg::new("interval").long("interval").short('i').help("采集周期，默认使用调度配置")),
        )
        .subcommand(
            Command::new("rollup")
                .about("为所有已知交易对分发一轮聚合")
                .arg(Arg::new("source").long("source").required(true))
                .arg(Arg::new("target").long("target").required(true)),
        )
        .subcommand(
            Command::new("compute")
                .about("同步聚合单个交易对并输出结果")
                .arg(Arg::new("base").long("base").required(true).help("基础资产，如 BTC"))
                .arg(Arg::new("quote").long("quote").required(true).help("报价资产，如 USDT"))
                .arg(Arg::new("source").long("source").required(true))
                .arg(Arg::new("target").long("target").required(true))
                .arg(
                    Arg::new("now")
                        .long("now")
                        .value_parser(clap::value_parser!(i64))
                        .help("以毫秒时间戳指定当前时间"),
                ),
        )
        .subcommand(
            Command::new("stream")
                .about("订阅所有已知交易对的实时K线")
                .arg(Arg::new("interval").long("interval").short('i').help("订阅周期，默认使用调度配置")),
        )
        .subcommand(Command::new("run").about("按周期边界持续调度采集与聚合"))
}

/// 进程内共享的服务对象
struct Services {
    config: PipelineConfig,
    store: Arc<dyn CandleStore>,
    aggregator: CandleAggregator,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
}

impl Services {
    fn build(config: PipelineConfig) -> Result<Self> {
        let store: Arc<dyn CandleStore> =
            Arc::new(Database::new(&config.database.database_path, config.database.pool_size)?);
        let feed: Arc<dyn MarketFeed> = Arc::new(BinanceApi::new(&config.exchange, &config.feed)?);

        let collector = CandleCollector::new(feed.clone(), store.clone(), config.feed.collect_limit);
        let aggregator = CandleAggregator::new(store.clone());
        let runner = JobRunner::new(collector, aggregator.clone());

        // 工作池使用独立的取消令牌，只在宽限期耗尽后才取消在途任务
        let pool = Arc::new(WorkerPool::new(
            Arc::new(runner),
            config.dispatcher.concurrency,
            CancellationToken::new(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            feed.clone(),
            SymbolRegistry::new(store.clone()),
            pool.clone(),
        ));

        Ok(Self {
            config,
            store,
            aggregator,
            pool,
            dispatcher,
        })
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.dispatcher.shutdown_grace_secs)
    }

    fn interval_arg(&self, matches: &ArgMatches) -> Result<Interval> {
        let name = matches
            .get_one::<String>("interval")
            .cloned()
            .unwrap_or_else(|| self.config.schedule.collect_interval.clone());
        Ok(Interval::parse(&name)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config = PipelineConfig::load(matches.get_one::<String>("config").map(String::as_str))
        .context("加载配置失败")?;
    // 持有 guard，直到 main 函数结束，确保文件日志被完整写入
    let _log_guard = init_logging(&config.logging, "kline_pipeline").context("初始化日志失败")?;

    info!(target: LOG_TARGET, log_type = "low_freq", exchange = %config.exchange, "服务启动");

    let result = run_app(config, &matches).await;
    if let Err(e) = &result {
        error!(target: LOG_TARGET, log_type = "module", error.details = %e, "服务异常退出");
    }
    result
}

async fn run_app(config: PipelineConfig, matches: &ArgMatches) -> Result<()> {
    let services = Services::build(config)?;

    // 收到关闭信号后停止接收新工作，已提交的任务在宽限期内继续执行
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            shutdown.cancel();
        }
    });

    match matches.subcommand() {
        Some(("discover", _)) => {
            if let Some(registered) = until_shutdown(&shutdown, services.dispatcher.discover()).await {
                println!("新登记交易对: {}", registered?);
            }
        }
        Some(("collect", sub)) => {
            let interval = services.interval_arg(sub)?;
            let result = services.dispatcher.collect_all(&interval, &shutdown).await;
            // 无论分发是否完整，已提交的任务都要在宽限期内排空
            let stats = services.pool.shutdown(services.grace()).await;
            let report = match result {
                Err(AppError::Cancelled(_)) => Default::default(),
                other => other?,
            };
            println!(
                "已分发 {} 个采集任务（提交失败 {}，新登记 {}，取消未提交 {}），成功 {}，失败 {}，取消 {}",
                report.dispatched,
                report.failed,
                report.discovered,
                report.skipped,
                stats.succeeded,
                stats.failed,
                stats.cancelled
            );
        }
        Some(("rollup", sub)) => {
            let source = parse_interval(sub, "source")?;
            let target = parse_interval(sub, "target")?;
            let result = services.dispatcher.compute_all(&source, &target, &shutdown).await;
            let stats = services.pool.shutdown(services.grace()).await;
            let report = result?;
            println!(
                "已分发 {} 个聚合任务（提交失败 {}，取消未提交 {}），成功 {}，失败 {}，取消 {}",
                report.dispatched, report.failed, report.skipped, stats.succeeded, stats.failed, stats.cancelled
            );
        }
        Some(("compute", sub)) => {
            let symbol = Symbol::new(
                services.config.exchange.clone(),
                required(sub, "base")?,
                required(sub, "quote")?,
            );
            let source = parse_interval(sub, "source")?;
            let target = parse_interval(sub, "target")?;
            let now_ms = sub
                .get_one::<i64>("now")
                .copied()
                .unwrap_or_else(|| Utc::now().timestamp_millis());

            let computed = until_shutdown(
                &shutdown,
                services.aggregator.compute(&symbol, &source, &target, now_ms),
            )
            .await;
            if let Some(candle) = computed {
                println!("{}", serde_json::to_string_pretty(&candle?)?);
            }
        }
        Some(("stream", sub)) => {
            let interval = services.interval_arg(sub)?;
            let streamer = KlineStreamer::new(
                Arc::new(TungsteniteConnector),
                services.store.clone(),
                services.config.feed.ws_url.clone(),
                ReconnectPolicy::from_config(&services.config.streamer),
            );
            streamer.stream_all(&interval, shutdown.clone()).await?;
            info!(
                target: LOG_TARGET,
                reconnect_attempts = streamer.reconnect_attempts(),
                "实时订阅已停止"
            );
        }
        Some(("run", _)) => {
            let scheduler = Scheduler::new(
                services.dispatcher.clone(),
                services.pool.clone(),
                &services.config.schedule,
            )?;
            scheduler.run(shutdown.clone()).await?;
            services.pool.shutdown(services.grace()).await;
        }
        Some((other, _)) => anyhow::bail!("未知子命令: {}", other),
        None => anyhow::bail!("缺少子命令"),
    }

    info!(target: LOG_TARGET, log_type = "low_freq", "服务正常退出");
    Ok(())
}

fn required(matches: &ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .with_context(|| format!("缺少参数 --{}", name))
}

fn parse_interval(matches: &ArgMatches, name: &str) -> Result<Interval> {
    Ok(Interval::parse(&required(matches, name)?)?)
}

/// 运行 `fut`，收到关闭信号时放弃并返回 None
async fn until_shutdown<F: Future>(shutdown: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = shutdown.cancelled() => {
            info!(target: LOG_TARGET, "收到关闭信号，放弃当前操作");
            None
        }
    }
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(target: LOG_TARGET, log_type = "module", error.details = %e, "安装Ctrl+C处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(target: LOG_TARGET, log_type = "module", error.details = %e, "安装SIGTERM处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(target: LOG_TARGET, signal = "Ctrl+C", "收到Ctrl+C信号，开始优雅关闭");
        },
        _ = terminate => {
            info!(target: LOG_TARGET, signal = "SIGTERM", "收到SIGTERM信号，开始优雅关闭");
        },
    }
}
