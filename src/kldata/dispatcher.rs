//! 批量分发
//!
//! 遍历已知交易对，为每个交易对提交一个独立任务，不等待任务结果。
//! 单个任务提交失败只记日志和计数，不影响其余交易对。
//! 取消信号到达后立即停止提交，剩余交易对计入 `skipped`

use crate::klcommon::{AppError, Interval, MarketFeed, Result, Symbol};
use crate::kldata::job::{AggregateJob, CollectJob, Job};
use crate::kldata::registry::SymbolRegistry;
use crate::kldata::worker_pool::JobDispatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// 一次批量分发的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// 尝试提交的任务数
    pub dispatched: usize,
    /// 提交失败的任务数
    pub failed: usize,
    /// 本次新发现的交易对数
    pub discovered: usize,
    /// 因取消而没有提交的交易对数
    pub skipped: usize,
}

pub struct Dispatcher {
    feed: Arc<dyn MarketFeed>,
    registry: SymbolRegistry,
    jobs: Arc<dyn JobDispatcher>,
}

impl Dispatcher {
    pub fn new(feed: Arc<dyn MarketFeed>, registry: SymbolRegistry, jobs: Arc<dyn JobDispatcher>) -> Self {
        Self { feed, registry, jobs }
    }

    /// 拉取交易对、登记新交易对，返回新登记数量
    pub async fn discover(&self) -> Result<usize> {
        let feed_symbols = self.feed.fetch_symbols().await?;
        self.registry.discover(&feed_symbols).await
    }

    /// 发现新交易对，然后为每个已知交易对提交一个采集任务
    ///
    /// 发现阶段被取消时返回 `AppError::Cancelled`，此时一个任务都没有提交
    #[instrument(target = "分发器", skip_all, fields(interval = %interval), err)]
    pub async fn collect_all(&self, interval: &Interval, cancel: &CancellationToken) -> Result<DispatchReport> {
        let discovered = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!("{} 采集分发", interval)));
            }
            discovered = self.discover() => discovered?,
        };
        let symbols = self.registry.list_known().await?;

        let mut report = self
            .dispatch_each(&symbols, cancel, |symbol| Job::Collect(CollectJob::new(symbol, interval)))
            .await;
        report.discovered = discovered;

        info!(
            target: "分发器",
            log_type = "low_freq",
            dispatched = report.dispatched,
            failed = report.failed,
            discovered = report.discovered,
            skipped = report.skipped,
            "采集任务分发完成"
        );
        Ok(report)
    }

    /// 为每个已知交易对提交一个聚合任务
    ///
    /// 周期比值在分发前校验一次，不合法时一个任务都不提交
    #[instrument(target = "分发器", skip_all, fields(source = %source, target = %target), err)]
    pub async fn compute_all(
        &self,
        source: &Interval,
        target: &Interval,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        target.ratio_to(source)?;
        let symbols = self.registry.list_known().await?;

        let report = self
            .dispatch_each(&symbols, cancel, |symbol| {
                Job::Aggregate(AggregateJob::new(symbol, source, target))
            })
            .await;

        info!(
            target: "分发器",
            log_type = "low_freq",
            dispatched = report.dispatched,
            failed = report.failed,
            skipped = report.skipped,
            "聚合任务分发完成"
        );
        Ok(report)
    }

    async fn dispatch_each<F>(&self, symbols: &[Symbol], cancel: &CancellationToken, make_job: F) -> DispatchReport
    where
        F: Fn(&Symbol) -> Job,
    {
        let mut report = DispatchReport::default();
        for (index, symbol) in symbols.iter().enumerate() {
            // 池满时提交会等待空位，等待期间同样响应取消
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.jobs.dispatch(make_job(symbol)) => Some(outcome),
            };
            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    report.skipped = symbols.len() - index;
                    warn!(target: "分发器", log_type = "module", skipped = report.skipped, "收到取消信号，停止分发");
                    break;
                }
            };

            report.dispatched += 1;
            if let Err(e) = outcome {
                report.failed += 1;
                error!(
                    target: "分发器",
                    symbol = %symbol,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "任务提交失败"
                );
            }
        }
        report
    }
}
