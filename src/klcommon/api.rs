use crate::klcommon::{AppError, ExchangeInfo, FeedConfig, Interval, RawKline, Result, Symbol};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// 行情源：交易对列表 + 最近K线
///
/// 采集器和分发器只依赖这个 trait，HTTP 细节留在 `BinanceApi` 里
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// 获取行情源上的全部交易对
    async fn fetch_symbols(&self) -> Result<Vec<Symbol>>;

    /// 获取某交易对最近 `limit` 根K线，按时间升序
    async fn fetch_recent_klines(&self, symbol_code: &str, interval: &Interval, limit: usize) -> Result<Vec<RawKline>>;
}

/// 币安API客户端
#[derive(Clone, Debug)]
pub struct BinanceApi {
    api_url: String,
    exchange: String,
    client: Client,
}

impl BinanceApi {
    /// 按配置创建API客户端，整个进程共享同一个连接池
    #[instrument(skip(config), fields(api_url = %config.rest_url), err)]
    pub fn new(exchange: &str, config: &FeedConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        if let Some(proxy_url) = &config.proxy_url {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => {
                    warn!(target: "api", log_type = "module", "设置代理失败，将尝试直接连接: {} - {}", proxy_url, e);
                }
            }
        }

        let client = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;

        info!(target: "api", log_type = "module", "初始化币安API客户端，端点: {}", config.rest_url);
        Ok(Self {
            api_url: config.rest_url.trim_end_matches('/').to_string(),
            exchange: exchange.to_string(),
            client,
        })
    }

    /// 发送 GET 请求，非成功状态转为 FetchError
    async fn get_text(&self, url: &str) -> Result<String> {
        let response = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let http_error = AppError::from(e);
                tracing::error!(
                    message = "HTTP请求失败",
                    url = %url,
                    error.summary = http_error.get_error_type_summary(),
                    error.details = %http_error
                );
                return Err(http_error);
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let api_error = AppError::FetchError(format!("{} 返回 {} - {}", url, status, text));
            tracing::error!(
                message = "API响应状态错误",
                url = %url,
                status = %status,
                error.summary = api_error.get_error_type_summary(),
                error.details = %api_error
            );
            return Err(api_error);
        }

        Ok(response.text().await?)
    }

    /// 获取交易所信息
    #[instrument(skip(self), err)]
    pub async fn get_exchange_info(&self) -> Result<ExchangeInfo> {
        let url = format!("{}/api/v3/exchangeInfo", self.api_url);
        let response_text = self.get_text(&url).await?;

        match serde_json::from_str::<ExchangeInfo>(&response_text) {
            Ok(info) => {
                debug!(target: "api", symbol_count = info.symbols.len(), "成功解析交易所信息");
                Ok(info)
            }
            Err(e) => {
                let preview: String = response_text.chars().take(1000).collect();
                error!(target: "api", log_type = "module", "解析交易所信息JSON失败: {}, 响应前1000个字符: {}",
                    e, preview);
                Err(AppError::JsonError(e))
            }
        }
    }
}

#[async_trait]
impl MarketFeed for BinanceApi {
    #[instrument(skip(self), err)]
    async fn fetch_symbols(&self) -> Result<Vec<Symbol>> {
        let info = self.get_exchange_info().await?;
        let symbols: Vec<Symbol> = info
            .symbols
            .into_iter()
            .map(|s| Symbol::new(self.exchange.clone(), s.base_asset, s.quote_asset))
            .collect();

        info!(target: "api", log_type = "module", "获取交易对成功，共 {} 个", symbols.len());
        Ok(symbols)
    }

    #[instrument(skip(self), fields(interval = %interval), err)]
    async fn fetch_recent_klines(&self, symbol_code: &str, interval: &Interval, limit: usize) -> Result<Vec<RawKline>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.api_url, symbol_code, interval.name(), limit
        );
        let response_text = self.get_text(&url).await?;

        let raw_klines: Vec<Vec<Value>> = serde_json::from_str(&response_text).map_err(|e| {
            error!(target: "api", log_type = "module", "{}/{}: 解析K线JSON失败: {}", symbol_code, interval, e);
            AppError::JsonError(e)
        })?;

        let mut klines: Vec<RawKline> = raw_klines
            .iter()
            .filter_map(|raw| RawKline::from_raw_kline(raw))
            .collect();

        if klines.len() != raw_klines.len() {
            warn!(
                target: "api",
                symbol = %symbol_code,
                interval = %interval,
                parsed_count = klines.len(),
                raw_count = raw_klines.len(),
                "部分K线数据解析失败，已跳过"
            );
        }

        klines.sort_by_key(|k| k.open_time);
        debug!(target: "api", symbol = %symbol_code, interval = %interval, kline_count = klines.len(), "K线数据解析完成");
        Ok(klines)
    }
}
