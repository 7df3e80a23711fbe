//! 分发任务载荷与执行

use crate::klcommon::{Interval, Result, Symbol};
use crate::kldata::aggregator::CandleAggregator;
use crate::kldata::collector::CandleCollector;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 单品种采集任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectJob {
    pub exchange: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub interval_name: String,
    pub interval_duration: i64,
}

impl CollectJob {
    pub fn new(symbol: &Symbol, interval: &Interval) -> Self {
        Self {
            exchange: symbol.exchange.clone(),
            base_asset: symbol.base_asset.clone(),
            quote_asset: symbol.quote_asset.clone(),
            interval_name: interval.name().to_string(),
            interval_duration: interval.duration_ms(),
        }
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(self.exchange.clone(), self.base_asset.clone(), self.quote_asset.clone())
    }

    pub fn interval(&self) -> Result<Interval> {
        Interval::new(self.interval_name.clone(), self.interval_duration)
    }
}

/// 单品种聚合任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateJob {
    pub exchange: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub source_interval_name: String,
    pub source_interval_duration: i64,
    pub target_interval_name: String,
    pub target_interval_duration: i64,
}

impl AggregateJob {
    pub fn new(symbol: &Symbol, source: &Interval, target: &Interval) -> Self {
        Self {
            exchange: symbol.exchange.clone(),
            base_asset: symbol.base_asset.clone(),
            quote_asset: symbol.quote_asset.clone(),
            source_interval_name: source.name().to_string(),
            source_interval_duration: source.duration_ms(),
            target_interval_name: target.name().to_string(),
            target_interval_duration: target.duration_ms(),
        }
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(self.exchange.clone(), self.base_asset.clone(), self.quote_asset.clone())
    }

    pub fn intervals(&self) -> Result<(Interval, Interval)> {
        Ok((
            Interval::new(self.source_interval_name.clone(), self.source_interval_duration)?,
            Interval::new(self.target_interval_name.clone(), self.target_interval_duration)?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Job {
    Collect(CollectJob),
    Aggregate(AggregateJob),
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Collect(job) => write!(f, "collect {}/{}", job.symbol(), job.interval_name),
            Job::Aggregate(job) => write!(
                f,
                "aggregate {}/{}->{}",
                job.symbol(),
                job.source_interval_name,
                job.target_interval_name
            ),
        }
    }
}

/// 任务执行结果，仅用于日志与统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Collected(usize),
    Aggregated { time: i64 },
}

fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 在工作池中执行任务
#[derive(Clone)]
pub struct JobRunner {
    collector: CandleCollector,
    aggregator: CandleAggregator,
    clock: fn() -> i64,
}

impl JobRunner {
    pub fn new(collector: CandleCollector, aggregator: CandleAggregator) -> Self {
        Self {
            collector,
            aggregator,
            clock: wall_clock_ms,
        }
    }

    /// 替换取当前毫秒时间的函数
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// 执行任务时才取当前时间，窗口以真正开始执行的时刻为准
    pub async fn run(&self, job: &Job) -> Result<JobOutcome> {
        let now_ms = (self.clock)();
        match job {
            Job::Collect(job) => {
                let interval = job.interval()?;
                let written = self.collector.collect_recent_at(&job.symbol(), &interval, now_ms).await?;
                Ok(JobOutcome::Collected(written))
            }
            Job::Aggregate(job) => {
                let (source, target) = job.intervals()?;
                let candle = self.aggregator.compute(&job.symbol(), &source, &target, now_ms).await?;
                Ok(JobOutcome::Aggregated { time: candle.time })
            }
        }
    }
}
