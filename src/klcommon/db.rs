use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Candle, PartitionKey, Symbol};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tokio::task;
use tracing::{debug, info, instrument};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// K线与交易对的存储契约
///
/// 所有写入都是按主键的幂等 upsert：同一个键写两次只保留最后一次的值
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// 按 (分区键, time) upsert 一根K线
    async fn upsert_candle(&self, candle: &Candle) -> Result<()>;

    /// 批量 upsert，返回写入条数
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        for candle in candles {
            self.upsert_candle(candle).await?;
        }
        Ok(candles.len())
    }

    /// 查询分区内 `time` 在 `[from, to]` 闭区间的K线，按时间升序
    async fn query_candles(&self, key: &PartitionKey, from: i64, to: i64) -> Result<Vec<Candle>>;

    async fn get_candle(&self, key: &PartitionKey, time: i64) -> Result<Option<Candle>>;

    async fn list_symbols(&self) -> Result<Vec<Symbol>>;

    /// 按 (exchange, symbol_code) upsert 交易对
    async fn put_symbol(&self, symbol: &Symbol) -> Result<()>;
}

/// SQLite 存储
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// 打开数据库文件，启用 WAL 并初始化表结构
    #[instrument(skip(db_path), fields(db_path = %db_path.as_ref().display()), err)]
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: "db", log_type = "module", "Using SQLite database at {}", db_path.display());

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ")
        });

        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_db()?;
        Ok(db)
    }

    /// 内存数据库，只有一个常驻连接，连接关闭即数据丢失
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_db()?;
        Ok(db)
    }

    /// Initialize database tables
    fn init_db(&self) -> Result<()> {
        let conn = self.get_connection()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS symbols (
                exchange TEXT NOT NULL,
                symbol_code TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (exchange, symbol_code)
            );
            CREATE TABLE IF NOT EXISTS candles (
                partition_key TEXT NOT NULL,
                time INTEGER NOT NULL,
                exchange TEXT NOT NULL,
                symbol_code TEXT NOT NULL,
                interval TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (partition_key, time)
            );",
        )
        .map_err(|e| AppError::DatabaseError(format!("Failed to create tables: {}", e)))?;

        debug!(target: "db", "数据库表初始化完成");
        Ok(())
    }

    pub fn get_connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))
    }

    /// 在阻塞线程池上执行数据库操作，并保留当前 span 作为父节点
    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        let parent_span = tracing::Span::current();
        task::spawn_blocking(move || parent_span.in_scope(|| op(&db)))
            .await
            .map_err(|join_error| AppError::DatabaseError(format!("数据库任务 panic: {:?}", join_error)))?
    }

    fn upsert_candles_blocking(&self, candles: &[Candle]) -> Result<usize> {
        let mut conn = self.get_connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::PersistError(format!("开始事务失败: {}", e)))?;

        for candle in candles {
            tx.execute(
                "INSERT INTO candles (
                    partition_key, time, exchange, symbol_code, interval,
                    open, high, low, close, volume
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(partition_key, time) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume",
                params![
                    candle.partition_key(),
                    candle.time,
                    candle.exchange,
                    candle.symbol_code,
                    candle.interval,
                    candle.open.to_string(),
                    candle.high.to_string(),
                    candle.low.to_string(),
                    candle.close.to_string(),
                    candle.volume.to_string(),
                ],
            )
            .map_err(|e| {
                AppError::PersistError(format!("写入K线失败 {} @ {}: {}", candle.partition_key(), candle.time, e))
            })?;
        }

        tx.commit()
            .map_err(|e| AppError::PersistError(format!("提交事务失败: {}", e)))?;
        Ok(candles.len())
    }

    fn candle_from_row(row: &Row<'_>) -> rusqlite::Result<[String; 5]> {
        Ok([row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?])
    }

    /// 存储中的十进制字符串在这里转回 Decimal
    fn build_candle(key: &PartitionKey, time: i64, values: [String; 5]) -> Result<Candle> {
        let [open, high, low, close, volume] = values;
        Ok(Candle {
            exchange: key.exchange.clone(),
            symbol_code: key.symbol_code.clone(),
            interval: key.interval.clone(),
            time,
            open: Decimal::from_str(&open)?,
            high: Decimal::from_str(&high)?,
            low: Decimal::from_str(&low)?,
            close: Decimal::from_str(&close)?,
            volume: Decimal::from_str(&volume)?,
        })
    }
}

#[async_trait]
impl CandleStore for Database {
    async fn upsert_candle(&self, candle: &Candle) -> Result<()> {
        let candle = candle.clone();
        self.run_blocking(move |db| db.upsert_candles_blocking(std::slice::from_ref(&candle)))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, candles), fields(kline_count = candles.len()), err)]
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        let candles = candles.to_vec();
        self.run_blocking(move |db| db.upsert_candles_blocking(&candles)).await
    }

    async fn query_candles(&self, key: &PartitionKey, from: i64, to: i64) -> Result<Vec<Candle>> {
        let key = key.clone();
        self.run_blocking(move |db| {
            let conn = db.get_connection()?;
            let mut stmt = conn.prepare(
                "SELECT time, open, high, low, close, volume FROM candles
                 WHERE partition_key = ?1 AND time BETWEEN ?2 AND ?3
                 ORDER BY time ASC",
            )?;
            let rows = stmt.query_map(params![key.to_string(), from, to], |row| {
                let time: i64 = row.get(0)?;
                let values = [row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?];
                Ok((time, values))
            })?;

            let mut candles = Vec::new();
            for row in rows {
                let (time, values) = row?;
                candles.push(Self::build_candle(&key, time, values)?);
            }
            Ok(candles)
        })
        .await
    }

    async fn get_candle(&self, key: &PartitionKey, time: i64) -> Result<Option<Candle>> {
        let key = key.clone();
        self.run_blocking(move |db| {
            let conn = db.get_connection()?;
            let values = conn
                .query_row(
                    "SELECT open, high, low, close, volume FROM candles
                     WHERE partition_key = ?1 AND time = ?2",
                    params![key.to_string(), time],
                    Self::candle_from_row,
                )
                .optional()?;
            values.map(|v| Self::build_candle(&key, time, v)).transpose()
        })
        .await
    }

    async fn list_symbols(&self) -> Result<Vec<Symbol>> {
        self.run_blocking(|db| {
            let conn = db.get_connection()?;
            let mut stmt = conn.prepare("SELECT exchange, base_asset, quote_asset FROM symbols")?;
            let rows = stmt.query_map([], |row| {
                Ok(Symbol::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let symbols = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(symbols)
        })
        .await
    }

    async fn put_symbol(&self, symbol: &Symbol) -> Result<()> {
        let symbol = symbol.clone();
        self.run_blocking(move |db| {
            let conn = db.get_connection()?;
            conn.execute(
                "INSERT INTO symbols (exchange, symbol_code, base_asset, quote_asset)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(exchange, symbol_code) DO UPDATE SET
                    base_asset = excluded.base_asset,
                    quote_asset = excluded.quote_asset",
                params![symbol.exchange, symbol.symbol_code(), symbol.base_asset, symbol.quote_asset],
            )
            .map_err(|e| AppError::PersistError(format!("保存交易对 {} 失败: {}", symbol, e)))?;
            debug!(target: "db", symbol = %symbol, "交易对保存成功");
            Ok(())
        })
        .await
    }
}
