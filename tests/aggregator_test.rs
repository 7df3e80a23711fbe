mod common;

#[cfg(test)]
mod tests {
    use crate::common::{candle, interval, memory_store, symbol};
    use kline_rollup::klcommon::interval::{DAY_MS, HOUR_MS, MINUTE_MS};
    use kline_rollup::klcommon::{AppError, Candle, CandleStore, PartitionKey};
    use kline_rollup::kldata::CandleAggregator;
    use rust_decimal_macros::dec;

    // 2023-11-14 22:00:00 UTC，整点
    const T0: i64 = 472_222 * HOUR_MS;

    /// 第 i 根：开 100+i，高 101+i，低 99+i，收 100.5+i，量 i.1
    fn minute_candles() -> Vec<Candle> {
        let btc = symbol("BTC", "USDT");
        let m1 = interval("1m");
        (0..60)
            .map(|i| {
                let open = format!("{}", 100 + i);
                let high = format!("{}", 101 + i);
                let low = format!("{}", 99 + i);
                let close = format!("{}.5", 100 + i);
                let volume = format!("{}.1", i);
                candle(&btc, &m1, T0 + i * MINUTE_MS, [&open, &high, &low, &close, &volume])
            })
            .collect()
    }

    #[tokio::test]
    async fn sixty_minutes_roll_into_one_hour() {
        let store = memory_store();
        let mut candles = minute_candles();
        // 中途的极值要被取到
        candles[30].high = dec!(500);
        candles[10].low = dec!(50);
        store.upsert_candles(&candles).await.unwrap();

        let aggregator = CandleAggregator::new(store.clone());
        let now = T0 + HOUR_MS + 30_000;
        let rolled = aggregator
            .compute(&symbol("BTC", "USDT"), &interval("1m"), &interval("1h"), now)
            .await
            .unwrap();

        assert_eq!(rolled.time, T0);
        assert_eq!(rolled.interval, "1h");
        assert_eq!(rolled.open, dec!(100));
        assert_eq!(rolled.close, dec!(159.5));
        assert_eq!(rolled.high, dec!(500));
        assert_eq!(rolled.low, dec!(50));
        // Σ(i + 0.1), i = 0..59
        assert_eq!(rolled.volume, dec!(1776.0));

        let key = PartitionKey::new("Binance", "BTCUSDT", &interval("1h"));
        let stored = store.get_candle(&key, T0).await.unwrap();
        assert_eq!(stored, Some(rolled));
        assert_eq!(store.query_candles(&key, 0, i64::MAX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_minute_fails_and_writes_nothing() {
        let store = memory_store();
        let candles: Vec<Candle> = minute_candles()
            .into_iter()
            .filter(|c| c.time != T0 + 1_200_000)
            .collect();
        store.upsert_candles(&candles).await.unwrap();

        let aggregator = CandleAggregator::new(store.clone());
        let err = aggregator
            .compute(&symbol("BTC", "USDT"), &interval("1m"), &interval("1h"), T0 + HOUR_MS)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)), "unexpected error: {err}");

        let key = PartitionKey::new("Binance", "BTCUSDT", &interval("1h"));
        assert!(store.query_candles(&key, 0, i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn misaligned_minute_fails_validation() {
        let store = memory_store();
        let mut candles = minute_candles();
        candles[20].time = T0 + 1_230_000;
        store.upsert_candles(&candles).await.unwrap();

        let aggregator = CandleAggregator::new(store.clone());
        let err = aggregator
            .compute(&symbol("BTC", "USDT"), &interval("1m"), &interval("1h"), T0 + HOUR_MS)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn window_still_open_is_not_aggregated() {
        let store = memory_store();
        store.upsert_candles(&minute_candles()).await.unwrap();

        // 当前时间落在 T0 这一小时之内，最近完整的是上一小时，而上一小时没有数据
        let aggregator = CandleAggregator::new(store.clone());
        let err = aggregator
            .compute(&symbol("BTC", "USDT"), &interval("1m"), &interval("1h"), T0 + 59 * MINUTE_MS)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn non_integer_ratio_is_a_config_error() {
        let store = memory_store();
        let aggregator = CandleAggregator::new(store.clone());
        let err = aggregator
            .compute(&symbol("BTC", "USDT"), &interval("7m"), &interval("1h"), T0 + HOUR_MS)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[tokio::test]
    async fn minutes_to_hours_to_day_keeps_exact_volume() {
        let store = memory_store();
        let eth = symbol("ETH", "BTC");
        let m1 = interval("1m");
        let h1 = interval("1h");
        let d1 = interval("1d");
        let day = 19_675 * DAY_MS;

        let minutes: Vec<Candle> = (0..1440)
            .map(|i| {
                let price = if i == 777 { "0.07" } else { "0.05" };
                candle(&eth, &m1, day + i * MINUTE_MS, ["0.05", price, "0.04", "0.05", "0.01"])
            })
            .collect();
        store.upsert_candles(&minutes).await.unwrap();

        let aggregator = CandleAggregator::new(store.clone());
        for hour in 0..24 {
            let now = day + (hour + 1) * HOUR_MS + 1;
            let rolled = aggregator.compute(&eth, &m1, &h1, now).await.unwrap();
            assert_eq!(rolled.time, day + hour * HOUR_MS);
            assert_eq!(rolled.volume, dec!(0.60));
        }

        let daily = aggregator.compute(&eth, &h1, &d1, day + DAY_MS + 1).await.unwrap();
        assert_eq!(daily.time, day);
        assert_eq!(daily.volume, dec!(14.40));
        assert_eq!(daily.high, dec!(0.07));
        assert_eq!(daily.low, dec!(0.04));
    }

    #[tokio::test]
    async fn gap_in_hours_stops_the_daily_rollup() {
        let store = memory_store();
        let eth = symbol("ETH", "BTC");
        let h1 = interval("1h");
        let day = 19_675 * DAY_MS;

        let hours: Vec<Candle> = (0..24)
            .filter(|h| *h != 13)
            .map(|h| candle(&eth, &h1, day + h * HOUR_MS, ["1", "2", "1", "2", "3"]))
            .collect();
        store.upsert_candles(&hours).await.unwrap();

        let aggregator = CandleAggregator::new(store.clone());
        let err = aggregator
            .compute(&eth, &h1, &interval("1d"), day + DAY_MS)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }
}
