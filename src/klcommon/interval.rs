use crate::klcommon::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;
pub const WEEK_MS: i64 = 7 * DAY_MS;

/// K线周期：名称 + 固定时长（毫秒）
///
/// 名称用于存储分区键和行情接口参数，时长用于窗口计算
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    name: String,
    duration_ms: i64,
}

impl Interval {
    /// 用显式的名称和时长构造周期（任务载荷中携带的形式）
    pub fn new(name: impl Into<String>, duration_ms: i64) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(AppError::ConfigError("周期名称不能为空".to_string()));
        }
        if duration_ms <= 0 {
            return Err(AppError::ConfigError(format!(
                "周期 {} 的时长必须大于0，实际为 {}",
                name, duration_ms
            )));
        }
        Ok(Self { name, duration_ms })
    }

    /// 解析币安风格的周期名称
    /// 例如: "1m" -> 60000, "1h" -> 3600000
    ///
    /// 月线 ("1M") 没有固定时长，不支持
    pub fn parse(name: &str) -> Result<Self> {
        let unit = name
            .chars()
            .last()
            .ok_or_else(|| AppError::ConfigError("周期名称不能为空".to_string()))?;
        let value: i64 = name[..name.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| AppError::ConfigError(format!("无效的时间周期: {}", name)))?;
        if value <= 0 {
            return Err(AppError::ConfigError(format!("无效的时间周期: {}", name)));
        }

        let unit_ms = match unit {
            'm' => MINUTE_MS,
            'h' => HOUR_MS,
            'd' => DAY_MS,
            'w' => WEEK_MS,
            _ => {
                return Err(AppError::ConfigError(format!(
                    "不支持的时间周期单位: {}",
                    name
                )))
            }
        };

        let duration_ms = value
            .checked_mul(unit_ms)
            .ok_or_else(|| AppError::ConfigError(format!("时间周期过长: {}", name)))?;
        Self::new(name, duration_ms)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// 计算 `self` 作为目标周期时，需要多少根 `source` 周期的K线
    ///
    /// 比值必须是大于1的整数，否则属于配置错误
    pub fn ratio_to(&self, source: &Interval) -> Result<usize> {
        if self.duration_ms <= source.duration_ms || self.duration_ms % source.duration_ms != 0 {
            return Err(AppError::ConfigError(format!(
                "目标周期 {}({}ms) 不是源周期 {}({}ms) 的整数倍",
                self.name, self.duration_ms, source.name, source.duration_ms
            )));
        }
        Ok((self.duration_ms / source.duration_ms) as usize)
    }

    /// 时间戳所在周期的起始时间
    pub fn align(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.duration_ms) * self.duration_ms
    }

    /// 以 `open_time` 开始的K线在 `now_ms` 时是否已经收盘
    pub fn is_closed(&self, open_time: i64, now_ms: i64) -> bool {
        open_time + self.duration_ms <= now_ms
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl std::str::FromStr for Interval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binance_interval_names() {
        assert_eq!(Interval::parse("1m").unwrap().duration_ms(), 60_000);
        assert_eq!(Interval::parse("15m").unwrap().duration_ms(), 900_000);
        assert_eq!(Interval::parse("1h").unwrap().duration_ms(), 3_600_000);
        assert_eq!(Interval::parse("4h").unwrap().duration_ms(), 14_400_000);
        assert_eq!(Interval::parse("1d").unwrap().duration_ms(), 86_400_000);
        assert_eq!(Interval::parse("1w").unwrap().duration_ms(), 604_800_000);
    }

    #[test]
    fn rejects_unknown_or_variable_intervals() {
        assert!(Interval::parse("").is_err());
        assert!(Interval::parse("m").is_err());
        assert!(Interval::parse("0m").is_err());
        assert!(Interval::parse("1M").is_err());
        assert!(Interval::parse("1x").is_err());
        assert!(matches!(
            Interval::parse("9999999999999w"),
            Err(AppError::ConfigError(_))
        ));
        assert!(Interval::new("1m", 0).is_err());
    }

    #[test]
    fn ratio_requires_exact_multiple() {
        let m1 = Interval::parse("1m").unwrap();
        let m7 = Interval::parse("7m").unwrap();
        let h1 = Interval::parse("1h").unwrap();
        let d1 = Interval::parse("1d").unwrap();

        assert_eq!(h1.ratio_to(&m1).unwrap(), 60);
        assert_eq!(d1.ratio_to(&h1).unwrap(), 24);
        assert!(h1.ratio_to(&m7).is_err());
        assert!(m1.ratio_to(&h1).is_err());
        assert!(h1.ratio_to(&h1).is_err());
    }

    #[test]
    fn align_and_closed() {
        let h1 = Interval::parse("1h").unwrap();
        assert_eq!(h1.align(7_199_999), 3_600_000);
        assert_eq!(h1.align(7_200_000), 7_200_000);
        assert!(h1.is_closed(3_600_000, 7_200_000));
        assert!(!h1.is_closed(3_600_000, 7_199_999));
    }
}
