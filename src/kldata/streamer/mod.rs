//! 实时K线推送采集
//!
//! 每个 (交易对, 周期) 一个长连接，只写入已收盘 (x == true) 的K线，按推送顺序逐条处理。
//! 断线后按指数退避重连，连接收到过消息后退避才重置

mod connection;
mod message;

pub use connection::{StreamConnector, TungsteniteConnector};
pub use message::{parse_kline_event, stream_url};

use crate::klcommon::{AppError, CandleStore, Interval, Result, StreamerConfig, Symbol};
use futures_util::future::join_all;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 重连退避策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// None 表示无限重连
    pub max_consecutive_failures: Option<u32>,
}

impl ReconnectPolicy {
    pub fn from_config(config: &StreamerConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }

    /// 第 `failures` 次连续失败后的等待时间：initial * 2^(failures-1)，不超过上限
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_consecutive_failures.map_or(false, |max| failures >= max)
    }
}

/// 一次连接的结束方式
enum SessionEnd {
    /// `delivered` 表示断开前是否收到过至少一条消息
    Disconnected { delivered: bool },
    Cancelled,
}

#[derive(Clone)]
pub struct KlineStreamer {
    connector: Arc<dyn StreamConnector>,
    store: Arc<dyn CandleStore>,
    ws_url: String,
    policy: ReconnectPolicy,
    reconnect_attempts: Arc<AtomicU64>,
}

impl KlineStreamer {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        store: Arc<dyn CandleStore>,
        ws_url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            connector,
            store,
            ws_url: ws_url.into(),
            policy,
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 累计重连次数（所有订阅共享）
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// 运行单个订阅直到被取消；配置了失败上限时，连续失败达到上限返回 WebSocketError
    ///
    /// 一次断线也计为一次失败。只有收到过消息的连接才清零计数，
    /// 连上即断的连接照常退避
    #[instrument(target = "推送", skip(self, symbol, interval, cancel), fields(symbol = %symbol, interval = %interval), err)]
    pub async fn run(&self, symbol: &Symbol, interval: &Interval, cancel: CancellationToken) -> Result<()> {
        let url = stream_url(&self.ws_url, &symbol.symbol_code(), interval)?;
        let mut failures: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                connected = self.connector.connect(url.as_str()) => connected,
            };

            match connected {
                Ok(messages) => {
                    info!(target: "推送", url = %url, "订阅已建立");
                    match self.consume(messages, symbol, interval, &cancel).await {
                        SessionEnd::Cancelled => return Ok(()),
                        SessionEnd::Disconnected { delivered } => {
                            if delivered {
                                failures = 0;
                            }
                            warn!(target: "推送", delivered, "连接断开");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        target: "推送",
                        log_type = "module",
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "连接失败"
                    );
                }
            }

            failures += 1;
            if self.policy.exhausted(failures) {
                return Err(AppError::WebSocketError(format!(
                    "{} 连续失败 {} 次，停止重连",
                    url, failures
                )));
            }

            let delay = self.policy.backoff(failures);
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(target: "推送", failures, attempt, delay_ms = delay.as_millis() as u64, "准备重连");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 为每个已知交易对启动一个订阅，直到全部结束
    pub async fn stream_all(&self, interval: &Interval, cancel: CancellationToken) -> Result<()> {
        let symbols = self.store.list_symbols().await?;
        info!(target: "推送", log_type = "module", count = symbols.len(), interval = %interval, "启动全部订阅");

        let handles = symbols.into_iter().map(|symbol| {
            let streamer = self.clone();
            let interval = interval.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let outcome = streamer.run(&symbol, &interval, cancel).await;
                (symbol, outcome)
            })
        });

        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((symbol, Err(e))) => {
                    error!(target: "推送", symbol = %symbol, error.summary = e.get_error_type_summary(), error.details = %e, "订阅终止");
                }
                Err(e) => error!(target: "推送", log_type = "module", error.details = %e, "订阅任务异常退出"),
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        mut messages: BoxStream<'static, Result<String>>,
        symbol: &Symbol,
        interval: &Interval,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut delivered = false;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                next = messages.next() => next,
            };

            match next {
                Some(Ok(text)) => {
                    delivered = true;
                    self.handle_message(&text, symbol, interval).await;
                }
                Some(Err(e)) => {
                    warn!(target: "推送", log_type = "module", error.details = %e, "读取推送失败");
                    return SessionEnd::Disconnected { delivered };
                }
                None => return SessionEnd::Disconnected { delivered },
            }
        }
    }

    /// 处理单条推送，失败只记日志，不中断订阅
    async fn handle_message(&self, text: &str, symbol: &Symbol, interval: &Interval) {
        let event = match parse_kline_event(text) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "推送", log_type = "module", error.summary = e.get_error_type_summary(), error.details = %e, "推送消息解析失败");
                return;
            }
        };

        if !event.kline.is_closed {
            return;
        }
        if event.kline.interval != interval.name() || !event.symbol.eq_ignore_ascii_case(&symbol.symbol_code()) {
            warn!(target: "推送", event_symbol = %event.symbol, event_interval = %event.kline.interval, "推送与订阅不匹配，已忽略");
            return;
        }

        let result = match event.kline.to_candle(symbol) {
            Ok(candle) => candle.check_for(interval).map(|_| candle),
            Err(e) => Err(e),
        };
        match result {
            Ok(candle) => match self.store.upsert_candle(&candle).await {
                Ok(()) => debug!(target: "推送", time = candle.time, "收盘K线已写入"),
                Err(e) => {
                    error!(target: "推送", time = candle.time, error.summary = e.get_error_type_summary(), error.details = %e, "收盘K线写入失败");
                }
            },
            Err(e) => {
                warn!(target: "推送", log_type = "module", error.summary = e.get_error_type_summary(), error.details = %e, "收盘K线无效，已跳过");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3_000),
            max_consecutive_failures: Some(5),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(4), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(3_000));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
