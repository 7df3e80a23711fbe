//! K线聚合器
//!
//! 把最近一个完整目标周期内的源周期K线合成为一根目标周期K线。
//! 源K线必须数量正确且严格连续，否则整个窗口拒绝聚合，不写入任何结果。
//! 1m -> 1h 与 1h -> 1d 是同一个操作的两次独立调用，每一级都单独校验

use crate::klcommon::{AppError, Candle, CandleStore, Interval, PartitionKey, Result, Symbol};
use std::sync::Arc;
use tracing::{info, instrument};

/// 一次聚合对应的时间窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupWindow {
    /// 窗口起点，即目标K线的开盘时间
    pub start: i64,
    /// 窗口终点（不含）
    pub end: i64,
    /// 窗口内应有的源K线根数
    pub expected_count: usize,
}

impl RollupWindow {
    /// 计算 `now_ms` 时最近一个已经完整结束的目标周期窗口
    pub fn last_completed(source: &Interval, target: &Interval, now_ms: i64) -> Result<Self> {
        let expected_count = target.ratio_to(source)?;
        let start = target.align(now_ms) - target.duration_ms();
        Ok(Self {
            start,
            end: start + target.duration_ms(),
            expected_count,
        })
    }

    /// 源K线查询的闭区间上界：窗口内最后一根源K线的开盘时间
    pub fn last_source_time(&self, source: &Interval) -> i64 {
        self.end - source.duration_ms()
    }
}

/// 校验源K线恰好覆盖整个窗口：数量一致，且第 i 根的时间为 `start + i * 源周期`
pub fn validate_consecutive(candles: &[Candle], window: &RollupWindow, source: &Interval) -> Result<()> {
    if candles.len() != window.expected_count {
        return Err(AppError::ValidationError(format!(
            "窗口 {} 期望 {} 根 {} K线，实际 {} 根",
            window.start,
            window.expected_count,
            source,
            candles.len()
        )));
    }

    for (index, candle) in candles.iter().enumerate() {
        let expected_time = window.start + index as i64 * source.duration_ms();
        if candle.time != expected_time {
            return Err(AppError::ValidationError(format!(
                "窗口 {} 第 {} 根K线期望时间 {}，实际 {}",
                window.start, index, expected_time, candle.time
            )));
        }
    }

    Ok(())
}

/// 合成目标K线：开盘取第一根，收盘取最后一根，高低取极值，成交量精确求和
///
/// 调用前必须已经通过 `validate_consecutive`
pub fn fold_candles(candles: &[Candle], target: &Interval) -> Result<Candle> {
    let (first, last) = match (candles.first(), candles.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(AppError::ValidationError("无法聚合空的K线组".to_string())),
    };

    let mut high = first.high;
    let mut low = first.low;
    let mut volume = rust_decimal::Decimal::ZERO;
    for candle in candles {
        high = high.max(candle.high);
        low = low.min(candle.low);
        volume = volume.checked_add(candle.volume).ok_or_else(|| {
            AppError::ValidationError(format!("窗口 {} 成交量求和溢出", first.time))
        })?;
    }

    Ok(Candle {
        exchange: first.exchange.clone(),
        symbol_code: first.symbol_code.clone(),
        interval: target.name().to_string(),
        time: first.time,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
    })
}

#[derive(Clone)]
pub struct CandleAggregator {
    store: Arc<dyn CandleStore>,
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self { store }
    }

    /// 聚合 `now_ms` 之前最近一个完整目标周期，并写入结果
    #[instrument(
        target = "聚合器",
        name = "compute_rollup",
        skip(self, symbol, source, target),
        fields(symbol = %symbol, source = %source, target = %target),
        err
    )]
    pub async fn compute(&self, symbol: &Symbol, source: &Interval, target: &Interval, now_ms: i64) -> Result<Candle> {
        let window = RollupWindow::last_completed(source, target, now_ms)?;
        let key = PartitionKey::new(&symbol.exchange, &symbol.symbol_code(), source);

        let candles = self
            .store
            .query_candles(&key, window.start, window.last_source_time(source))
            .await?;

        validate_consecutive(&candles, &window, source)?;
        let rolled = fold_candles(&candles, target)?;

        self.store.upsert_candle(&rolled).await?;
        info!(
            target: "聚合器",
            time = rolled.time,
            source_count = candles.len(),
            volume = %rolled.volume,
            "聚合K线写入完成"
        );
        Ok(rolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn interval(name: &str) -> Interval {
        Interval::parse(name).unwrap()
    }

    fn candle(time: i64, open: i64, high: i64, low: i64, close: i64, volume: &str) -> Candle {
        Candle {
            exchange: "Binance".to_string(),
            symbol_code: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            time,
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: volume.parse().unwrap(),
        }
    }

    #[test]
    fn window_is_one_full_target_period_behind_now() {
        let m1 = interval("1m");
        let h1 = interval("1h");

        // 01:30 -> 窗口 [00:00, 01:00)
        let window = RollupWindow::last_completed(&m1, &h1, 5_400_000).unwrap();
        assert_eq!(window, RollupWindow { start: 0, end: 3_600_000, expected_count: 60 });
        assert_eq!(window.last_source_time(&m1), 3_540_000);

        // 恰好在边界上：上一个小时刚结束
        let window = RollupWindow::last_completed(&m1, &h1, 7_200_000).unwrap();
        assert_eq!(window.start, 3_600_000);
    }

    #[test]
    fn window_rejects_non_integer_ratio() {
        let err = RollupWindow::last_completed(&interval("7m"), &interval("1h"), 5_400_000).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn validation_detects_count_gap_duplicate_and_misalignment() {
        let m1 = interval("1m");
        let window = RollupWindow { start: 0, end: 180_000, expected_count: 3 };

        let good = vec![candle(0, 1, 2, 1, 2, "1"), candle(60_000, 1, 2, 1, 2, "1"), candle(120_000, 1, 2, 1, 2, "1")];
        assert!(validate_consecutive(&good, &window, &m1).is_ok());

        let missing = vec![good[0].clone(), good[2].clone()];
        assert!(validate_consecutive(&missing, &window, &m1).is_err());

        let duplicate = vec![good[0].clone(), good[1].clone(), good[1].clone()];
        assert!(validate_consecutive(&duplicate, &window, &m1).is_err());

        let shifted = vec![candle(60_000, 1, 2, 1, 2, "1"), candle(120_000, 1, 2, 1, 2, "1"), candle(180_000, 1, 2, 1, 2, "1")];
        assert!(validate_consecutive(&shifted, &window, &m1).is_err());

        let extra = vec![good[0].clone(), good[1].clone(), good[2].clone(), candle(180_000, 1, 2, 1, 2, "1")];
        assert!(validate_consecutive(&extra, &window, &m1).is_err());
    }

    #[test]
    fn fold_takes_extremes_and_exact_volume_sum() {
        let candles = vec![
            candle(0, 10, 12, 9, 11, "0.1"),
            candle(60_000, 11, 15, 10, 14, "0.2"),
            candle(120_000, 14, 14, 7, 8, "0.3"),
        ];
        let rolled = fold_candles(&candles, &interval("3m")).unwrap();

        assert_eq!(rolled.time, 0);
        assert_eq!(rolled.interval, "3m");
        assert_eq!(rolled.open, Decimal::from(10));
        assert_eq!(rolled.close, Decimal::from(8));
        assert_eq!(rolled.high, Decimal::from(15));
        assert_eq!(rolled.low, Decimal::from(7));
        // 浮点求和会得到 0.6000000000000001
        assert_eq!(rolled.volume, "0.6".parse::<Decimal>().unwrap());
    }

    #[test]
    fn fold_rejects_volume_overflow() {
        let mut huge = candle(0, 1, 2, 1, 2, "1");
        huge.volume = Decimal::MAX;
        let mut next = huge.clone();
        next.time = 60_000;
        let err = fold_candles(&[huge, next], &interval("2m")).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[test]
    fn fold_rejects_empty_input() {
        assert!(fold_candles(&[], &interval("1h")).is_err());
    }
}
