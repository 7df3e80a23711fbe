use crate::klcommon::{Interval, KlineEvent, Result};
use serde_json::Value;
use url::Url;

/// 单个交易对单个周期的订阅地址: {ws_url}/ws/{symbol}@kline_{interval}
pub fn stream_url(ws_url: &str, symbol_code: &str, interval: &Interval) -> Result<Url> {
    let url = format!(
        "{}/ws/{}@kline_{}",
        ws_url.trim_end_matches('/'),
        symbol_code.to_lowercase(),
        interval.name()
    );
    Ok(Url::parse(&url)?)
}

/// 解析推送消息
///
/// 同时接受单流格式和组合流的 {"stream", "data"} 外层包装。
/// 非K线消息（如订阅响应）返回 Ok(None)
pub fn parse_kline_event(text: &str) -> Result<Option<KlineEvent>> {
    let mut json: Value = serde_json::from_str(text)?;
    if let Some(data) = json.get_mut("data") {
        json = data.take();
    }

    if json.get("e").and_then(Value::as_str) != Some("kline") {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(json)?))
}
