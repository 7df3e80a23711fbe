//! 单品种最近K线采集
//!
//! 拉取最近几根K线，丢弃尚未收盘的那一根，其余逐根 upsert。
//! 过滤后一根都没有属于上游数据缺口，作为 ZeroWritesError 上报而不是静默忽略

use crate::klcommon::{AppError, Candle, CandleStore, Interval, MarketFeed, Result, Symbol};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct CandleCollector {
    feed: Arc<dyn MarketFeed>,
    store: Arc<dyn CandleStore>,
    limit: usize,
}

impl CandleCollector {
    pub fn new(feed: Arc<dyn MarketFeed>, store: Arc<dyn CandleStore>, limit: usize) -> Self {
        Self { feed, store, limit }
    }

    /// 以当前时间为准采集
    pub async fn collect_recent(&self, symbol: &Symbol, interval: &Interval) -> Result<usize> {
        self.collect_recent_at(symbol, interval, Utc::now().timestamp_millis()).await
    }

    /// 采集 `now_ms` 时刻已经收盘的最近K线，返回写入条数
    #[instrument(
        target = "采集器",
        name = "collect_recent",
        skip(self, symbol, interval),
        fields(symbol = %symbol, interval = %interval),
        err
    )]
    pub async fn collect_recent_at(&self, symbol: &Symbol, interval: &Interval, now_ms: i64) -> Result<usize> {
        let symbol_code = symbol.symbol_code();
        let raw_klines = self
            .feed
            .fetch_recent_klines(&symbol_code, interval, self.limit)
            .await?;
        let fetched = raw_klines.len();

        let closed: Vec<Candle> = raw_klines
            .into_iter()
            .filter(|raw| interval.is_closed(raw.open_time, now_ms))
            .map(|raw| raw.into_candle(symbol, interval))
            .filter(|candle| match candle.check_for(interval) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        target: "采集器",
                        time = candle.time,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "跳过异常K线"
                    );
                    false
                }
            })
            .collect();

        if closed.is_empty() {
            return Err(AppError::ZeroWritesError(format!(
                "{}/{}: 拉取到 {} 根K线，但没有已收盘的可写入K线",
                symbol_code, interval, fetched
            )));
        }

        let written = self.store.upsert_candles(&closed).await?;
        debug!(target: "采集器", fetched, written, "最近K线写入完成");
        Ok(written)
    }
}
