//! 有界工作池
//!
//! 每个品种的任务互相独立，提交后不等待结果。并发上限由信号量控制：
//! 池满时 `dispatch` 等待空位（背压）；关闭后的提交返回 DispatchError。
//! 关闭时先排空在途任务，超过宽限期再取消剩余任务

use crate::klcommon::{AppError, Result};
use crate::kldata::job::{Job, JobOutcome, JobRunner};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

/// 异步任务分发：只负责"提交"，不关心任务本身的成败
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: Job) -> Result<()>;
}

/// 工作池统计
#[derive(Debug, Default)]
pub struct PoolStats {
    pub submitted: AtomicUsize,
    pub succeeded: AtomicUsize,
    pub failed: AtomicUsize,
    pub cancelled: AtomicUsize,
}

/// 统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatsSnapshot {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}

/// 工作池实际执行任务的部分，便于测试时替换
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: &Job) -> Result<JobOutcome>;
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn execute(&self, job: &Job) -> Result<JobOutcome> {
        self.run(job).await
    }
}

pub struct WorkerPool {
    executor: Arc<dyn JobExecutor>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    stats: Arc<PoolStats>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(executor: Arc<dyn JobExecutor>, concurrency: usize, cancel: CancellationToken) -> Self {
        info!(target: "工作池", log_type = "module", concurrency, "工作池已创建");
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            tracker: TaskTracker::new(),
            cancel,
            stats: Arc::new(PoolStats::default()),
            concurrency,
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 正在执行的任务数
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.semaphore.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// 等待当前已提交的任务全部完成（不关闭工作池）
    pub async fn wait_idle(&self) {
        let _all = self
            .semaphore
            .acquire_many(self.concurrency as u32)
            .await;
    }

    /// 关闭工作池：拒绝新任务，等待在途任务 `grace` 时长，之后取消剩余任务并等待其退出
    pub async fn shutdown(&self, grace: Duration) -> PoolStatsSnapshot {
        self.tracker.close();
        self.semaphore.close();
        info!(target: "工作池", in_flight = self.tracker.len(), "工作池开始关闭，等待在途任务完成");

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(target: "工作池", remaining = self.tracker.len(), "宽限期已过，取消剩余任务");
            self.cancel.cancel();
            self.tracker.wait().await;
        }

        let stats = self.stats();
        info!(
            target: "工作池",
            log_type = "low_freq",
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "工作池已关闭"
        );
        stats
    }
}

#[async_trait]
impl JobDispatcher for WorkerPool {
    async fn dispatch(&self, job: Job) -> Result<()> {
        if self.tracker.is_closed() || self.cancel.is_cancelled() {
            return Err(AppError::DispatchError(format!("工作池已关闭，无法提交 {}", job)));
        }

        // 池满时在这里等待，形成背压
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| AppError::DispatchError(format!("工作池已关闭，无法提交 {}", job)))?,
            _ = self.cancel.cancelled() => {
                return Err(AppError::DispatchError(format!("工作池已取消，无法提交 {}", job)));
            }
        };

        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        let executor = self.executor.clone();
        let stats = self.stats.clone();
        let cancel = self.cancel.child_token();
        let span = tracing::info_span!(target: "工作池", "pool_job", job = %job);

        self.tracker.spawn(
            async move {
                let _permit = permit;
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AppError::Cancelled(job.to_string())),
                    result = executor.execute(&job) => result,
                };

                match result {
                    Ok(outcome) => {
                        stats.succeeded.fetch_add(1, Ordering::SeqCst);
                        debug!(target: "工作池", ?outcome, "任务完成");
                    }
                    Err(AppError::Cancelled(_)) => {
                        stats.cancelled.fetch_add(1, Ordering::SeqCst);
                        warn!(target: "工作池", "任务被取消");
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::SeqCst);
                        error!(
                            target: "工作池",
                            log_type = "module",
                            error.summary = e.get_error_type_summary(),
                            error.details = %e,
                            retryable = e.is_retryable(),
                            "任务失败"
                        );
                    }
                }
            }
            .instrument(span),
        );

        Ok(())
    }
}
