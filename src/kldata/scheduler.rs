//! 定时调度
//!
//! 对齐到采集周期边界：每个边界（加上等待余量）分发一轮采集；
//! 边界同时是某个聚合目标周期的边界时，按配置顺序依次分发聚合。
//! 每一步之间等待工作池空闲，保证下一级读取到的是上一级已经写完的数据。
//! 取消信号在分发和等待阶段都会被响应，本轮剩余步骤直接放弃

use crate::klcommon::{AppError, Interval, Result, ScheduleConfig};
use crate::kldata::dispatcher::Dispatcher;
use crate::kldata::worker_pool::WorkerPool;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 在 `boundary_ms` 这个边界上需要执行的聚合，保持配置顺序
pub fn due_rollups(rollups: &[(Interval, Interval)], boundary_ms: i64) -> Vec<&(Interval, Interval)> {
    rollups
        .iter()
        .filter(|(_, target)| target.align(boundary_ms) == boundary_ms)
        .collect()
}

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    collect_interval: Interval,
    rollups: Vec<(Interval, Interval)>,
    settle_delay: Duration,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, pool: Arc<WorkerPool>, config: &ScheduleConfig) -> Result<Self> {
        let collect_interval = Interval::parse(&config.collect_interval)?;
        let rollups = config
            .rollups
            .iter()
            .map(|rollup| rollup.intervals())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dispatcher,
            pool,
            collect_interval,
            rollups,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        })
    }

    /// `now_ms` 之后（不含）的下一个周期边界
    pub fn next_boundary(interval: &Interval, now_ms: i64) -> i64 {
        interval.align(now_ms) + interval.duration_ms()
    }

    /// 持续调度直到取消
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            target: "调度器",
            log_type = "module",
            collect_interval = %self.collect_interval,
            rollups = self.rollups.len(),
            "调度器启动"
        );

        loop {
            let now_ms = Utc::now().timestamp_millis();
            let boundary = Self::next_boundary(&self.collect_interval, now_ms);
            let wait = Duration::from_millis((boundary - now_ms).max(0) as u64) + self.settle_delay;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(target: "调度器", "调度器收到取消信号，停止");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.tick(boundary, &cancel).await;
        }
    }

    /// 执行一个边界上的全部工作
    pub async fn tick(&self, boundary_ms: i64, cancel: &CancellationToken) {
        info!(target: "调度器", boundary_ms, "开始本轮调度");

        match self.dispatcher.collect_all(&self.collect_interval, cancel).await {
            Ok(_) | Err(AppError::Cancelled(_)) => {}
            Err(e) => {
                error!(target: "调度器", log_type = "module", error.summary = e.get_error_type_summary(), error.details = %e, "采集分发失败");
            }
        }
        if !self.settle(cancel).await {
            return;
        }

        for (source, target) in due_rollups(&self.rollups, boundary_ms) {
            match self.dispatcher.compute_all(source, target, cancel).await {
                Ok(report) if report.failed > 0 => {
                    warn!(target: "调度器", source = %source, target = %target, failed = report.failed, "部分聚合任务提交失败");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(target: "调度器", source = %source, target = %target, error.summary = e.get_error_type_summary(), error.details = %e, "聚合分发失败");
                }
            }
            if !self.settle(cancel).await {
                return;
            }
        }
    }

    /// 等待工作池空闲；期间收到取消信号返回 false
    async fn settle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(target: "调度器", in_flight = self.pool.in_flight(), "等待任务完成时收到取消信号，放弃本轮剩余步骤");
                false
            }
            _ = self.pool.wait_idle() => true,
        }
    }
}
