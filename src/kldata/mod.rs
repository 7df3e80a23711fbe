// 数据服务：交易对发现、K线采集、聚合、分发与调度
pub mod aggregator;
pub mod collector;
pub mod dispatcher;
pub mod job;
pub mod registry;
pub mod scheduler;
pub mod streamer;
pub mod worker_pool;

// 重新导出常用类型，方便使用
pub use aggregator::{fold_candles, validate_consecutive, CandleAggregator, RollupWindow};
pub use collector::CandleCollector;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use job::{AggregateJob, CollectJob, Job, JobOutcome, JobRunner};
pub use registry::SymbolRegistry;
pub use scheduler::Scheduler;
pub use streamer::{KlineStreamer, ReconnectPolicy, StreamConnector, TungsteniteConnector};
pub use worker_pool::{JobDispatcher, JobExecutor, PoolStatsSnapshot, WorkerPool};
