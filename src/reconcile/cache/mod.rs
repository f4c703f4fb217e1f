use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

use crate::reconcile::model::cursor::ingest_cursor::IngestCursorModel;
use crate::reconcile::model::order::exchange_order::{
    ExchangeOrderEntity, ExchangeOrderModel, OrderQuery,
};

/// 抽象：对账缓存（订单系统记录 + 摄取游标）
/// 摄取端写入，匹配端读取；游标按(账户,交易对)键单调前进
#[async_trait]
pub trait ReconcileCache: Send + Sync {
    /// 幂等合并，按order_id去重，返回新插入行数
    async fn upsert_orders(
        &self,
        account_id: &str,
        symbol: &str,
        orders: &[ExchangeOrderEntity],
    ) -> Result<usize>;

    /// 未摄取过的key返回0
    async fn get_cursor(&self, account_id: &str, symbol: &str) -> Result<i64>;

    /// 只前进不后退，传入更小的值是no-op
    async fn set_cursor(&self, account_id: &str, symbol: &str, order_id: i64) -> Result<()>;

    /// 按 event_time 升序返回命中过滤条件的订单
    async fn query_orders(
        &self,
        account_id: &str,
        symbol: &str,
        filter: &OrderQuery,
    ) -> Result<Vec<ExchangeOrderEntity>>;
}

fn make_key(account_id: &str, symbol: &str) -> String {
    format!("{}:{}", account_id, symbol)
}

/// 具体实现：进程内缓存（DashMap），用于测试与 --mem-cache 模式
/// 不跨进程持久化，重启后游标归零
pub struct MemoryReconcileCache {
    orders: DashMap<String, BTreeMap<i64, ExchangeOrderEntity>>,
    cursors: DashMap<String, i64>,
}

impl MemoryReconcileCache {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            cursors: DashMap::new(),
        }
    }
}

impl Default for MemoryReconcileCache {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(order: &ExchangeOrderEntity, filter: &OrderQuery) -> bool {
    if let Some(side) = &filter.side {
        if &order.side != side {
            return false;
        }
    }
    if let Some(statuses) = &filter.statuses {
        if !statuses.iter().any(|s| s == &order.status) {
            return false;
        }
    }
    if let Some(reduce_only) = filter.reduce_only {
        if order.reduce_only != reduce_only {
            return false;
        }
    }
    if let Some(close_position) = filter.close_position {
        if order.close_position != close_position {
            return false;
        }
    }
    if let Some(begin_ts) = filter.begin_ts {
        if order.event_time < begin_ts {
            return false;
        }
    }
    if let Some(end_ts) = filter.end_ts {
        if order.event_time > end_ts {
            return false;
        }
    }
    true
}

#[async_trait]
impl ReconcileCache for MemoryReconcileCache {
    async fn upsert_orders(
        &self,
        account_id: &str,
        symbol: &str,
        orders: &[ExchangeOrderEntity],
    ) -> Result<usize> {
        let key = make_key(account_id, symbol);
        let mut bucket = self.orders.entry(key).or_default();
        let mut inserted = 0;
        for order in orders {
            // 已缓存的order_id是no-op，入库后订单不可变
            if !bucket.contains_key(&order.order_id) {
                bucket.insert(order.order_id, order.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_cursor(&self, account_id: &str, symbol: &str) -> Result<i64> {
        Ok(self
            .cursors
            .get(&make_key(account_id, symbol))
            .map(|v| *v)
            .unwrap_or(0))
    }

    async fn set_cursor(&self, account_id: &str, symbol: &str, order_id: i64) -> Result<()> {
        // entry API对同key写是串行的
        let mut entry = self.cursors.entry(make_key(account_id, symbol)).or_insert(0);
        if order_id > *entry {
            *entry = order_id;
        }
        Ok(())
    }

    async fn query_orders(
        &self,
        account_id: &str,
        symbol: &str,
        filter: &OrderQuery,
    ) -> Result<Vec<ExchangeOrderEntity>> {
        let key = make_key(account_id, symbol);
        let mut rows: Vec<ExchangeOrderEntity> = match self.orders.get(&key) {
            Some(bucket) => bucket
                .values()
                .filter(|o| matches_filter(o, filter))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        rows.sort_by_key(|o| o.event_time);
        Ok(rows)
    }
}

/// 具体实现：MySQL持久化缓存，跨进程保留游标与订单
pub struct DbReconcileCache {
    orders: ExchangeOrderModel,
    cursors: IngestCursorModel,
}

impl DbReconcileCache {
    pub fn new() -> Self {
        Self {
            orders: ExchangeOrderModel::new(),
            cursors: IngestCursorModel::new(),
        }
    }

    /// 按需建表，幂等
    pub async fn ensure_tables(&self) -> Result<()> {
        self.orders.create_table().await?;
        self.cursors.create_table().await?;
        Ok(())
    }
}

#[async_trait]
impl ReconcileCache for DbReconcileCache {
    async fn upsert_orders(
        &self,
        account_id: &str,
        symbol: &str,
        orders: &[ExchangeOrderEntity],
    ) -> Result<usize> {
        let _ = (account_id, symbol); // 行内已携带账户与交易对
        self.orders.upsert(orders).await
    }

    async fn get_cursor(&self, account_id: &str, symbol: &str) -> Result<i64> {
        self.cursors.get(account_id, symbol).await
    }

    async fn set_cursor(&self, account_id: &str, symbol: &str, order_id: i64) -> Result<()> {
        self.cursors.advance(account_id, symbol, order_id).await
    }

    async fn query_orders(
        &self,
        account_id: &str,
        symbol: &str,
        filter: &OrderQuery,
    ) -> Result<Vec<ExchangeOrderEntity>> {
        self.orders.query(account_id, symbol, filter).await
    }
}

/// 便捷构造：返回trait对象方便注入
pub fn memory_cache() -> Arc<dyn ReconcileCache> {
    Arc::new(MemoryReconcileCache::new())
}
