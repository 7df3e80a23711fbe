use crate::klcommon::{AppError, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info};

/// 推送连接：建立连接后返回文本消息流，流结束即视为断线
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<BoxStream<'static, Result<String>>>;
}

/// 基于 tokio-tungstenite 的连接实现
///
/// Ping 由 tungstenite 在读取时自动回复 Pong，这里只透出文本帧
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl StreamConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<BoxStream<'static, Result<String>>> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| AppError::WebSocketError(format!("WebSocket连接失败: {}", e)))?;
        info!(target: "推送", url, status = %response.status(), "WebSocket连接已建立");

        let messages = stream::unfold(ws_stream, |mut ws| async move {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some((Ok(text), ws)),
                    Some(Ok(Message::Close(frame))) => {
                        info!(target: "推送", ?frame, "收到关闭消息");
                        return None;
                    }
                    Some(Ok(other)) => debug!(target: "推送", "忽略非文本消息: {:?}", other),
                    Some(Err(e)) => {
                        let err = AppError::WebSocketError(format!("WebSocket读取失败: {}", e));
                        return Some((Err(err), ws));
                    }
                    None => return None,
                }
            }
        });

        Ok(messages.boxed())
    }
}
