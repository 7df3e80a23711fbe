use crate::klcommon::{AppError, Interval, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 交易对：(交易所, 基础资产, 报价资产)
///
/// 唯一标识为 (exchange, symbol_code)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    pub exchange: String,
    pub base_asset: String,
    pub quote_asset: String,
}

impl Symbol {
    pub fn new(exchange: impl Into<String>, base_asset: impl Into<String>, quote_asset: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
        }
    }

    /// 交易对代码，例如 BTC + USDT -> BTCUSDT
    pub fn symbol_code(&self) -> String {
        format!("{}{}", self.base_asset, self.quote_asset)
    }

    /// 注册表中的唯一键
    pub fn identity(&self) -> (String, String) {
        (self.exchange.clone(), self.symbol_code())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol_code())
    }
}

/// K线存储分区键，序列化为 "{exchange}-{symbolCode}-{interval}"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub exchange: String,
    pub symbol_code: String,
    pub interval: String,
}

impl PartitionKey {
    pub fn new(exchange: &str, symbol_code: &str, interval: &Interval) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol_code: symbol_code.to_string(),
            interval: interval.name().to_string(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.exchange, self.symbol_code, self.interval)
    }
}

/// 已收盘的K线 - 存储与聚合使用的统一表示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol_code: String,
    pub interval: String,
    /// 周期开始时间（毫秒），总是周期时长的整数倍
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn partition_key(&self) -> String {
        format!("{}-{}-{}", self.exchange, self.symbol_code, self.interval)
    }

    /// 检查 OHLCV 的取值约束：
    /// `low <= open, close <= high` 且 `volume >= 0`
    pub fn check_bounds(&self) -> Result<()> {
        let ok = self.low <= self.high
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && !self.volume.is_sign_negative();
        if ok {
            Ok(())
        } else {
            Err(AppError::ValidationError(format!(
                "{} @ {}: OHLCV 取值不满足约束 (o={}, h={}, l={}, c={}, v={})",
                self.partition_key(), self.time, self.open, self.high, self.low, self.close, self.volume
            )))
        }
    }

    /// 写入前的完整校验：开盘时间对齐到 `interval` 边界，且 OHLCV 满足约束
    pub fn check_for(&self, interval: &Interval) -> Result<()> {
        if interval.align(self.time) != self.time {
            return Err(AppError::ValidationError(format!(
                "K线开盘时间 {} 没有对齐到 {} 周期",
                self.time, interval
            )));
        }
        self.check_bounds()
    }
}

/// 行情接口返回的一行原始K线（只使用前六个字段）
#[derive(Debug, Clone, PartialEq)]
pub struct RawKline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl RawKline {
    /// 从 `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]` 解析
    pub fn from_raw_kline(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 6 {
            return None;
        }

        let decimal = |v: &serde_json::Value| -> Option<Decimal> {
            match v {
                serde_json::Value::String(s) => Decimal::from_str(s).ok(),
                serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
                _ => None,
            }
        };

        Some(Self {
            open_time: raw[0].as_i64()?,
            open: decimal(&raw[1])?,
            high: decimal(&raw[2])?,
            low: decimal(&raw[3])?,
            close: decimal(&raw[4])?,
            volume: decimal(&raw[5])?,
        })
    }

    pub fn into_candle(self, symbol: &Symbol, interval: &Interval) -> Candle {
        Candle {
            exchange: symbol.exchange.clone(),
            symbol_code: symbol.symbol_code(),
            interval: interval.name().to_string(),
            time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// 交易所信息中的单个交易对（只保留需要的字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSymbol {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
}

/// 交易所信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    #[serde(default)]
    pub server_time: i64,
    #[serde(default)]
    pub symbols: Vec<ExchangeSymbol>,
}

/// K线推送事件中的K线数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineData {
    #[serde(rename = "t")]
    pub start_time: i64,
    #[serde(rename = "T")]
    pub end_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl KlineData {
    /// 转换为存储格式，价格与成交量在这里转为 Decimal
    pub fn to_candle(&self, symbol: &Symbol) -> Result<Candle> {
        Ok(Candle {
            exchange: symbol.exchange.clone(),
            symbol_code: symbol.symbol_code(),
            interval: self.interval.clone(),
            time: self.start_time,
            open: Decimal::from_str(&self.open)?,
            high: Decimal::from_str(&self.high)?,
            low: Decimal::from_str(&self.low)?,
            close: Decimal::from_str(&self.close)?,
            volume: Decimal::from_str(&self.volume)?,
        })
    }
}

/// K线推送事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlineData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partition_key_format() {
        let symbol = Symbol::new("Binance", "BTC", "USDT");
        let key = PartitionKey::new(&symbol.exchange, &symbol.symbol_code(), &Interval::parse("1m").unwrap());
        assert_eq!(key.to_string(), "Binance-BTCUSDT-1m");
    }

    #[test]
    fn raw_kline_uses_first_six_fields() {
        let raw = json!([1499040000000i64, "0.01634790", "0.80000000", "0.01575800", "0.01577100",
                         "148976.11427815", 1499644799999i64, "2434.19055334", 308, "1756.87402397",
                         "28.46694368", "0"]);
        let parsed = RawKline::from_raw_kline(raw.as_array().unwrap()).unwrap();
        assert_eq!(parsed.open_time, 1499040000000);
        assert_eq!(parsed.volume, Decimal::from_str("148976.11427815").unwrap());

        let short = json!([1499040000000i64, "1", "2", "0.5", "1.5"]);
        assert!(RawKline::from_raw_kline(short.as_array().unwrap()).is_none());

        let garbage = json!([1499040000000i64, "1", "abc", "0.5", "1.5", "10"]);
        assert!(RawKline::from_raw_kline(garbage.as_array().unwrap()).is_none());
    }

    #[test]
    fn bounds_check_rejects_inverted_candle() {
        let mut candle = Candle {
            exchange: "Binance".into(),
            symbol_code: "BTCUSDT".into(),
            interval: "1m".into(),
            time: 0,
            open: Decimal::from(10),
            high: Decimal::from(12),
            low: Decimal::from(9),
            close: Decimal::from(11),
            volume: Decimal::from(5),
        };
        assert!(candle.check_bounds().is_ok());

        candle.high = Decimal::from(8);
        assert!(candle.check_bounds().is_err());

        candle.high = Decimal::from(12);
        candle.volume = Decimal::from(-1);
        assert!(candle.check_bounds().is_err());
    }

    #[test]
    fn full_check_requires_interval_alignment() {
        let m1 = Interval::parse("1m").unwrap();
        let mut candle = Candle {
            exchange: "Binance".into(),
            symbol_code: "BTCUSDT".into(),
            interval: "1m".into(),
            time: 120_000,
            open: Decimal::from(10),
            high: Decimal::from(12),
            low: Decimal::from(9),
            close: Decimal::from(11),
            volume: Decimal::from(5),
        };
        assert!(candle.check_for(&m1).is_ok());

        candle.time = 120_500;
        assert!(matches!(candle.check_for(&m1), Err(AppError::ValidationError(_))));
    }
}
