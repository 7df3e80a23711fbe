//! 交易对注册表
//!
//! 只追加不删除。发现新交易对时逐个写入，不做跨批次加锁：
//! 并发发现可能重复写同一个交易对，但写入是按 (exchange, symbol_code) 的幂等 upsert

use crate::klcommon::{CandleStore, Result, Symbol};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct SymbolRegistry {
    store: Arc<dyn CandleStore>,
}

impl SymbolRegistry {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self { store }
    }

    /// 已注册的全部交易对，顺序不保证
    pub async fn list_known(&self) -> Result<Vec<Symbol>> {
        self.store.list_symbols().await
    }

    /// 注册行情源中尚未登记的交易对，返回新写入的数量
    #[instrument(target = "品种注册", skip_all, fields(feed_count = feed_symbols.len()), err)]
    pub async fn discover(&self, feed_symbols: &[Symbol]) -> Result<usize> {
        let mut known: HashSet<(String, String)> = self
            .list_known()
            .await?
            .iter()
            .map(Symbol::identity)
            .collect();

        let mut registered = 0;
        for symbol in feed_symbols {
            // insert 返回 false 说明已登记，或同一批次中重复出现
            if !known.insert(symbol.identity()) {
                continue;
            }
            self.store.put_symbol(symbol).await?;
            registered += 1;
            info!(target: "品种注册", symbol = %symbol, "发现新交易对");
        }

        info!(target: "品种注册", log_type = "low_freq", registered, known_count = known.len(), "交易对发现完成");
        Ok(registered)
    }
}
