use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;

use order_audit::error::AppError;
use order_audit::reconcile::binance::{OrderHistoryDto, OrderSource, ORDER_PAGE_LIMIT};
use order_audit::reconcile::cache::{MemoryReconcileCache, ReconcileCache};
use order_audit::reconcile::ingest::OrderIngestor;

fn dto(symbol: &str, order_id: i64) -> OrderHistoryDto {
    OrderHistoryDto {
        order_id,
        symbol: symbol.to_string(),
        status: "FILLED".to_string(),
        client_order_id: None,
        price: "100.0".to_string(),
        avg_price: "100.0".to_string(),
        orig_qty: "1.0".to_string(),
        executed_qty: "1.0".to_string(),
        side: "BUY".to_string(),
        position_side: Some("BOTH".to_string()),
        order_type: Some("MARKET".to_string()),
        reduce_only: false,
        close_position: false,
        time: 1_762_776_000_000 + order_id,
        update_time: None,
    }
}

/// 内存分页订单源：按 order_id >= from 过滤并截断到limit，记录每次调用
struct PagedOrderSource {
    orders: Vec<OrderHistoryDto>,
    fail_symbols: HashSet<String>,
    calls: Mutex<Vec<(String, Option<i64>, Instant)>>,
}

impl PagedOrderSource {
    fn new(orders: Vec<OrderHistoryDto>) -> Self {
        Self {
            orders,
            fail_symbols: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, symbol: &str) -> Self {
        self.fail_symbols.insert(symbol.to_string());
        self
    }

    fn calls(&self) -> Vec<(String, Option<i64>, Instant)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderSource for PagedOrderSource {
    async fn order_history(
        &self,
        symbol: &str,
        from_order_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<OrderHistoryDto>, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((symbol.to_string(), from_order_id, Instant::now()));
        if self.fail_symbols.contains(symbol) {
            return Err(AppError::NetworkError("模拟超时".to_string()));
        }
        let from = from_order_id.unwrap_or(0);
        let limit = limit.unwrap_or(ORDER_PAGE_LIMIT);
        Ok(self
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.order_id >= from)
            .take(limit)
            .cloned()
            .collect())
    }
}

fn ingestor(
    source: Arc<PagedOrderSource>,
    cache: Arc<dyn ReconcileCache>,
    interval_ms: u64,
) -> OrderIngestor {
    OrderIngestor::with_source(source, "acct".to_string(), cache, interval_ms)
}

#[tokio::test(start_paused = true)]
async fn test_pagination_and_cursor_advance() -> anyhow::Result<()> {
    // 1500个订单要两页才拉完
    let orders: Vec<OrderHistoryDto> = (1..=1500).map(|id| dto("BTCUSDT", id)).collect();
    let source = Arc::new(PagedOrderSource::new(orders));
    let cache: Arc<dyn ReconcileCache> = Arc::new(MemoryReconcileCache::new());

    let outcome = ingestor(Arc::clone(&source), Arc::clone(&cache), 300)
        .sync_account(&["BTCUSDT".to_string()])
        .await;
    assert_eq!(outcome.inserted, 1500);
    assert!(outcome.items.is_empty());
    assert_eq!(cache.get_cursor("acct", "BTCUSDT").await?, 1500);

    // 第一页从游标+1起拉，第二页续在上一页最大ID之后；尾页不满一页即停
    let calls = source.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, Some(1));
    assert_eq!(calls[1].1, Some(1001));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_second_run_resumes_from_cursor() -> anyhow::Result<()> {
    let orders: Vec<OrderHistoryDto> = (1..=10).map(|id| dto("BTCUSDT", id)).collect();
    let source = Arc::new(PagedOrderSource::new(orders));
    let cache: Arc<dyn ReconcileCache> = Arc::new(MemoryReconcileCache::new());

    let first = ingestor(Arc::clone(&source), Arc::clone(&cache), 300)
        .sync_account(&["BTCUSDT".to_string()])
        .await;
    assert_eq!(first.inserted, 10);

    // 同一缓存上再跑：从11起拉，拉空，不产生重复行，游标不动
    let second = ingestor(Arc::clone(&source), Arc::clone(&cache), 300)
        .sync_account(&["BTCUSDT".to_string()])
        .await;
    assert_eq!(second.inserted, 0);
    assert_eq!(cache.get_cursor("acct", "BTCUSDT").await?, 10);
    let calls = source.calls();
    assert_eq!(calls.last().unwrap().1, Some(11));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_symbol_failure_is_isolated() -> anyhow::Result<()> {
    let orders: Vec<OrderHistoryDto> = (1..=5).map(|id| dto("BTCUSDT", id)).collect();
    let source = Arc::new(PagedOrderSource::new(orders).failing("ETHUSDT"));
    let cache: Arc<dyn ReconcileCache> = Arc::new(MemoryReconcileCache::new());

    let outcome = ingestor(Arc::clone(&source), Arc::clone(&cache), 300)
        .sync_account(&["ETHUSDT".to_string(), "BTCUSDT".to_string()])
        .await;

    // 失败的交易对只记一条失败项，游标留在原处；其他交易对不受影响
    assert_eq!(outcome.inserted, 5);
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(cache.get_cursor("acct", "ETHUSDT").await?, 0);
    assert_eq!(cache.get_cursor("acct", "BTCUSDT").await?, 5);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_min_interval_applies_across_symbols() -> anyhow::Result<()> {
    let mut orders: Vec<OrderHistoryDto> = (1..=3).map(|id| dto("BTCUSDT", id)).collect();
    orders.push(dto("ETHUSDT", 7));
    let source = Arc::new(PagedOrderSource::new(orders));
    let cache: Arc<dyn ReconcileCache> = Arc::new(MemoryReconcileCache::new());

    ingestor(Arc::clone(&source), cache, 300)
        .sync_account(&["BTCUSDT".to_string(), "ETHUSDT".to_string()])
        .await;

    // 两个交易对各只有一页：限速仍按请求生效，第二个请求等满间隔
    let calls = source.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "BTCUSDT");
    assert_eq!(calls[1].0, "ETHUSDT");
    let gap = calls[1].2 - calls[0].2;
    assert!(gap >= std::time::Duration::from_millis(300));
    Ok(())
}
