pub mod binance_client;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;
use crate::reconcile::binance::binance_client::BinanceClient;
use crate::reconcile::credential::ResolvedAccount;

/// 单页最大订单数（/fapi/v1/allOrders 的limit上限）
pub const ORDER_PAGE_LIMIT: usize = 1000;

/// 订单历史返回结构（字段与币安合约接口一致，数值为字符串）
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderHistoryDto {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    pub client_order_id: Option<String>,
    pub price: String,
    pub avg_price: String,
    pub orig_qty: String,
    pub executed_qty: String,
    pub side: String,
    pub position_side: Option<String>,
    #[serde(rename = "type")]
    pub order_type: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    /// 下单时间，毫秒
    pub time: i64,
    /// 最近更新时间，毫秒
    pub update_time: Option<i64>,
}

impl OrderHistoryDto {
    /// 事件时间：优先取更新时间（成交/撤销都会刷新），否则取下单时间
    pub fn event_time(&self) -> i64 {
        self.update_time.unwrap_or(self.time)
    }
}

/// 抽象：订单历史来源，摄取端只依赖这个口子
/// 生产实现走交易所REST，测试用内存假数据分页
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// 返回 order_id >= from_order_id 的订单，最多limit条
    async fn order_history(
        &self,
        symbol: &str,
        from_order_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<OrderHistoryDto>, AppError>;
}

pub struct FuturesApi {
    client: BinanceClient,
}

impl FuturesApi {
    pub fn new(account: &ResolvedAccount) -> Self {
        Self {
            client: BinanceClient::new(
                account.api_key.clone(),
                account.secret_key.clone(),
                account.base_url.clone(),
            ),
        }
    }

    /// 查询订单历史
    /// symbol 是  交易对
    /// order_id 否  返回orderId >= 该值的订单
    /// limit 否  单页条数，默认500，最大1000
    pub async fn get_all_orders(
        &self,
        symbol: &str,
        from_order_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<OrderHistoryDto>, AppError> {
        let mut query = format!("symbol={}", symbol);
        if let Some(order_id) = from_order_id {
            query.push_str(&format!("&orderId={}", order_id));
        }
        if let Some(limit) = limit {
            query.push_str(&format!("&limit={}", limit));
        }
        let res: Vec<OrderHistoryDto> = self
            .client
            .send_signed_request(Method::GET, "/fapi/v1/allOrders", &query)
            .await?;
        debug!("allOrders symbol={} got {} rows", symbol, res.len());
        Ok(res)
    }
}

#[async_trait]
impl OrderSource for FuturesApi {
    async fn order_history(
        &self,
        symbol: &str,
        from_order_id: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<OrderHistoryDto>, AppError> {
        self.get_all_orders(symbol, from_order_id, limit).await
    }
}
