extern crate rbatis;

use anyhow::{anyhow, Result};
use rbatis::rbdc::db::ExecResult;
use rbatis::{crud, RBatis};
use rbs::Value;
use serde::{Deserialize, Serialize};

use crate::app_config::db;
use crate::reconcile::binance::OrderHistoryDto;

/// table：交易所订单缓存（入库后不可变，交易所历史对客户端是追加式的）
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct ExchangeOrderEntity {
    pub account_id: String,
    pub symbol: String,
    pub order_id: i64,
    pub side: String,         // BUY/SELL
    pub position_side: String, // LONG/SHORT/BOTH
    pub status: String,       // NEW/PARTIALLY_FILLED/FILLED/CANCELED...
    pub reduce_only: bool,
    pub close_position: bool,
    pub executed_qty: String,
    pub avg_price: String,
    pub event_time: i64, // 毫秒
}

crud!(ExchangeOrderEntity {}, "exchange_orders");

impl ExchangeOrderEntity {
    pub fn from_dto(account_id: &str, dto: &OrderHistoryDto) -> Self {
        Self {
            account_id: account_id.to_string(),
            symbol: dto.symbol.clone(),
            order_id: dto.order_id,
            side: dto.side.clone(),
            position_side: dto.position_side.clone().unwrap_or_else(|| "BOTH".to_string()),
            status: dto.status.clone(),
            reduce_only: dto.reduce_only,
            close_position: dto.close_position,
            executed_qty: dto.executed_qty.clone(),
            avg_price: dto.avg_price.clone(),
            event_time: dto.event_time(),
        }
    }

    pub fn executed_qty_f64(&self) -> f64 {
        self.executed_qty.parse::<f64>().unwrap_or(0.0)
    }

    pub fn avg_price_f64(&self) -> f64 {
        self.avg_price.parse::<f64>().unwrap_or(0.0)
    }
}

/// 查询过滤条件，全部可选，按 event_time 升序返回
#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    pub side: Option<String>,
    pub statuses: Option<Vec<String>>,
    pub reduce_only: Option<bool>,
    pub close_position: Option<bool>,
    /// event_time >= begin_ts（毫秒）
    pub begin_ts: Option<i64>,
    /// event_time <= end_ts（毫秒）
    pub end_ts: Option<i64>,
}

pub struct ExchangeOrderModel {
    db: &'static RBatis,
}

impl ExchangeOrderModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn create_table(&self) -> Result<ExecResult> {
        let create_table_sql = "CREATE TABLE IF NOT EXISTS `exchange_orders` (
            `id` bigint NOT NULL AUTO_INCREMENT,
            `account_id` varchar(64) NOT NULL COMMENT '交易所账户ID',
            `symbol` varchar(32) NOT NULL COMMENT '交易对',
            `order_id` bigint NOT NULL COMMENT '交易所订单ID，账户+交易对内单调递增',
            `side` varchar(8) NOT NULL COMMENT 'BUY/SELL',
            `position_side` varchar(8) NOT NULL COMMENT 'LONG/SHORT/BOTH',
            `status` varchar(24) NOT NULL COMMENT '订单状态',
            `reduce_only` tinyint(1) NOT NULL DEFAULT 0,
            `close_position` tinyint(1) NOT NULL DEFAULT 0,
            `executed_qty` varchar(32) NOT NULL COMMENT '成交数量',
            `avg_price` varchar(32) NOT NULL COMMENT '成交均价',
            `event_time` bigint NOT NULL COMMENT '事件时间，毫秒',
            `created_at` datetime NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (`id`),
            UNIQUE KEY `uk_account_symbol_order` (`account_id`,`symbol`,`order_id`),
            KEY `idx_event_time` (`account_id`,`symbol`,`event_time`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_0900_ai_ci;";
        let res = self.db.exec(create_table_sql, vec![]).await?;
        Ok(res)
    }

    /// 幂等合并：按 (account_id, symbol, order_id) 去重，返回本次新插入的行数
    pub async fn upsert(&self, list: &[ExchangeOrderEntity]) -> Result<usize> {
        if list.is_empty() {
            return Ok(0);
        }
        let mut query = String::from(
            "INSERT IGNORE INTO exchange_orders \
             (account_id, symbol, order_id, side, position_side, status, reduce_only, close_position, executed_qty, avg_price, event_time) VALUES ",
        );
        let mut params: Vec<Value> = Vec::new();
        for order in list {
            query.push_str("(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?),");
            params.push(order.account_id.clone().into());
            params.push(order.symbol.clone().into());
            params.push(order.order_id.into());
            params.push(order.side.clone().into());
            params.push(order.position_side.clone().into());
            params.push(order.status.clone().into());
            params.push(order.reduce_only.into());
            params.push(order.close_position.into());
            params.push(order.executed_qty.clone().into());
            params.push(order.avg_price.clone().into());
            params.push(order.event_time.into());
        }
        query.pop(); // 去掉末尾逗号
        let res = self.db.exec(&query, params).await?;
        Ok(res.rows_affected as usize)
    }

    pub async fn query(
        &self,
        account_id: &str,
        symbol: &str,
        filter: &OrderQuery,
    ) -> Result<Vec<ExchangeOrderEntity>> {
        let mut sql = String::from(
            "SELECT account_id, symbol, order_id, side, position_side, status, \
             reduce_only, close_position, executed_qty, avg_price, event_time \
             FROM exchange_orders WHERE account_id = ? AND symbol = ?",
        );
        let mut params: Vec<Value> = vec![account_id.into(), symbol.into()];
        if let Some(side) = &filter.side {
            sql.push_str(" AND side = ?");
            params.push(side.clone().into());
        }
        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Err(anyhow!("statuses filter is empty"));
            }
            let placeholders = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({})", placeholders));
            for s in statuses {
                params.push(s.clone().into());
            }
        }
        if let Some(reduce_only) = filter.reduce_only {
            sql.push_str(" AND reduce_only = ?");
            params.push(reduce_only.into());
        }
        if let Some(close_position) = filter.close_position {
            sql.push_str(" AND close_position = ?");
            params.push(close_position.into());
        }
        if let Some(begin_ts) = filter.begin_ts {
            sql.push_str(" AND event_time >= ?");
            params.push(begin_ts.into());
        }
        if let Some(end_ts) = filter.end_ts {
            sql.push_str(" AND event_time <= ?");
            params.push(end_ts.into());
        }
        sql.push_str(" ORDER BY event_time ASC");
        let rows: Vec<ExchangeOrderEntity> = self.db.query_decode(&sql, params).await?;
        Ok(rows)
    }
}
