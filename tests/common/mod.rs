// 集成测试共用的替身实现与数据构造工具
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use kline_rollup::klcommon::{AppError, Candle, Database, Interval, MarketFeed, RawKline, Result, Symbol};
use kline_rollup::kldata::{Job, JobDispatcher, StreamConnector};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const EXCHANGE: &str = "Binance";

pub fn memory_store() -> Arc<Database> {
    Arc::new(Database::in_memory().expect("创建内存数据库失败"))
}

pub fn symbol(base: &str, quote: &str) -> Symbol {
    Symbol::new(EXCHANGE, base, quote)
}

pub fn interval(name: &str) -> Interval {
    Interval::parse(name).expect("无效周期")
}

pub fn dec(value: &str) -> Decimal {
    value.parse().expect("无效的十进制数")
}

pub fn candle(symbol: &Symbol, interval: &Interval, time: i64, ohlcv: [&str; 5]) -> Candle {
    Candle {
        exchange: symbol.exchange.clone(),
        symbol_code: symbol.symbol_code(),
        interval: interval.name().to_string(),
        time,
        open: dec(ohlcv[0]),
        high: dec(ohlcv[1]),
        low: dec(ohlcv[2]),
        close: dec(ohlcv[3]),
        volume: dec(ohlcv[4]),
    }
}

pub fn raw_kline(open_time: i64, close: &str) -> RawKline {
    RawKline {
        open_time,
        open: dec("100"),
        high: dec("110"),
        low: dec("90"),
        close: dec(close),
        volume: dec("1.5"),
    }
}

/// 币安单流格式的K线推送
pub fn kline_event(symbol_code: &str, interval: &str, start: i64, close: &str, is_closed: bool) -> String {
    serde_json::json!({
        "e": "kline",
        "E": start + 60_000,
        "s": symbol_code,
        "k": {
            "t": start,
            "T": start + 59_999,
            "s": symbol_code,
            "i": interval,
            "o": "100",
            "c": close,
            "h": "110",
            "l": "90",
            "v": "2.5",
            "x": is_closed
        }
    })
    .to_string()
}

/// 行情源替身
///
/// `live` 为 true 时，没有预置数据的交易对会按当前时间生成最近K线（最后一根未收盘）
#[derive(Default)]
pub struct FakeFeed {
    pub symbols: Mutex<Vec<Symbol>>,
    pub klines: Mutex<HashMap<String, Vec<RawKline>>>,
    pub fail_symbols: Mutex<HashSet<String>>,
    pub unreachable: bool,
    pub live: bool,
    pub kline_requests: AtomicUsize,
}

impl FakeFeed {
    pub fn with_symbols(symbols: Vec<Symbol>) -> Self {
        Self {
            symbols: Mutex::new(symbols),
            ..Self::default()
        }
    }

    pub fn set_klines(&self, symbol_code: &str, klines: Vec<RawKline>) {
        self.klines.lock().unwrap().insert(symbol_code.to_string(), klines);
    }
}

#[async_trait]
impl MarketFeed for FakeFeed {
    async fn fetch_symbols(&self) -> Result<Vec<Symbol>> {
        if self.unreachable {
            return Err(AppError::FetchError("行情源不可达".to_string()));
        }
        Ok(self.symbols.lock().unwrap().clone())
    }

    async fn fetch_recent_klines(&self, symbol_code: &str, interval: &Interval, limit: usize) -> Result<Vec<RawKline>> {
        self.kline_requests.fetch_add(1, Ordering::SeqCst);
        if self.unreachable || self.fail_symbols.lock().unwrap().contains(symbol_code) {
            return Err(AppError::FetchError(format!("{} 返回 503", symbol_code)));
        }

        if let Some(klines) = self.klines.lock().unwrap().get(symbol_code) {
            return Ok(klines.clone());
        }

        if self.live {
            let current = interval.align(Utc::now().timestamp_millis());
            let klines = (0..limit as i64)
                .rev()
                .map(|back| raw_kline(current - back * interval.duration_ms(), "105"))
                .collect();
            return Ok(klines);
        }

        Ok(Vec::new())
    }
}

/// 只记录提交的任务；`reject` 中的交易对代码提交失败
#[derive(Default)]
pub struct RecordingDispatcher {
    pub jobs: Mutex<Vec<Job>>,
    pub reject: HashSet<String>,
}

impl RecordingDispatcher {
    pub fn rejecting(symbol_codes: &[&str]) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            reject: symbol_codes.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn recorded(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: Job) -> Result<()> {
        let symbol_code = match &job {
            Job::Collect(job) => job.symbol().symbol_code(),
            Job::Aggregate(job) => job.symbol().symbol_code(),
        };
        if self.reject.contains(&symbol_code) {
            return Err(AppError::DispatchError(format!("拒绝提交 {}", symbol_code)));
        }
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

/// 一次连接的脚本：成功时按顺序推送消息后断开
pub enum Session {
    Messages(Vec<String>),
    /// 连接成功但永远不推送也不断开
    Idle,
    Refused,
}

/// 按脚本返回连接结果；脚本耗尽后一律连接失败
#[derive(Default)]
pub struct ScriptedConnector {
    pub script: Mutex<VecDeque<Session>>,
    pub connects: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Session>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<BoxStream<'static, Result<String>>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Session::Messages(messages)) => Ok(stream::iter(messages.into_iter().map(Ok)).boxed()),
            Some(Session::Idle) => Ok(stream::pending().boxed()),
            Some(Session::Refused) | None => Err(AppError::WebSocketError("连接被拒绝".to_string())),
        }
    }
}
