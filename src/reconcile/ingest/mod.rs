use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::reconcile::binance::{FuturesApi, OrderSource, ORDER_PAGE_LIMIT};
use crate::reconcile::cache::ReconcileCache;
use crate::reconcile::credential::ResolvedAccount;
use crate::reconcile::model::order::exchange_order::ExchangeOrderEntity;
use crate::reconcile::report::ReportItem;

/// 单个账户一轮摄取的产出，由调用方合并进总报告
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub inserted: usize,
    pub items: Vec<ReportItem>,
}

/// 增量订单摄取：每个(账户,交易对)从游标处续拉，逐页合并进缓存
/// 每个账户持有自己的限速状态，交易对串行处理
pub struct OrderIngestor {
    source: Arc<dyn OrderSource>,
    account_id: String,
    cache: Arc<dyn ReconcileCache>,
    /// 相邻请求之间的最小间隔（按请求生效，跨交易对也适用）
    min_interval: Duration,
    requested: AtomicBool,
}

impl OrderIngestor {
    pub fn new(
        account: &ResolvedAccount,
        cache: Arc<dyn ReconcileCache>,
        min_request_interval_ms: u64,
    ) -> Self {
        Self::with_source(
            Arc::new(FuturesApi::new(account)),
            account.account_id.clone(),
            cache,
            min_request_interval_ms,
        )
    }

    /// 注入订单来源，测试用假分页数据替换REST客户端
    pub fn with_source(
        source: Arc<dyn OrderSource>,
        account_id: String,
        cache: Arc<dyn ReconcileCache>,
        min_request_interval_ms: u64,
    ) -> Self {
        Self {
            source,
            account_id,
            cache,
            min_interval: Duration::from_millis(min_request_interval_ms),
            requested: AtomicBool::new(false),
        }
    }

    /// 账户的首个请求直接发出，之后每个请求之前都等满最小间隔
    async fn throttle(&self) {
        if self.requested.swap(true, Ordering::Relaxed) {
            sleep(self.min_interval).await;
        }
    }

    /// 同步账户下所有交易对（账户内串行，共用同一限速状态）
    /// 单个交易对失败只记录并跳过，游标不动，下一轮从原处重试
    pub async fn sync_account(&self, symbols: &[String]) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        for symbol in symbols {
            match self.sync_symbol(symbol).await {
                Ok(inserted) => {
                    outcome.inserted += inserted;
                    info!(
                        "摄取完成 account={} symbol={} 新增={}",
                        self.account_id, symbol, inserted
                    );
                }
                Err(e) => {
                    warn!(
                        "摄取失败 account={} symbol={}: {}",
                        self.account_id, symbol, e
                    );
                    outcome.items.push(ReportItem::FetchFailure {
                        account_id: self.account_id.clone(),
                        symbol: symbol.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }
        outcome
    }

    /// 单个交易对：拉取 order_id > 游标 的订单，分页合并，游标推进到本批最大ID
    /// 每页先合并再请求下一页，内存有界；合并幂等，重复拉取不产生重复行
    pub async fn sync_symbol(&self, symbol: &str) -> Result<usize> {
        let mut cursor = self.cache.get_cursor(&self.account_id, symbol).await?;
        let mut total_inserted = 0usize;

        loop {
            self.throttle().await;
            // allOrders 返回 orderId >= 参数值，所以从 cursor+1 起拉
            let page = self
                .source
                .order_history(symbol, Some(cursor + 1), Some(ORDER_PAGE_LIMIT))
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            let rows: Vec<ExchangeOrderEntity> = page
                .iter()
                .filter(|o| o.order_id > cursor)
                .map(|o| ExchangeOrderEntity::from_dto(&self.account_id, o))
                .collect();
            let max_id = rows.iter().map(|r| r.order_id).max().unwrap_or(cursor);

            if !rows.is_empty() {
                total_inserted += self
                    .cache
                    .upsert_orders(&self.account_id, symbol, &rows)
                    .await?;
                // 本页合并成功后才推进游标
                self.cache
                    .set_cursor(&self.account_id, symbol, max_id)
                    .await?;
                cursor = max_id;
            }

            if page_len < ORDER_PAGE_LIMIT {
                break;
            }
        }
        Ok(total_inserted)
    }
}
