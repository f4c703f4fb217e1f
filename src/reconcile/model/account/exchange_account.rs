extern crate rbatis;

use anyhow::Result;
use rbatis::{crud, RBatis};
use serde::{Deserialize, Serialize};

use crate::app_config::db;

/// table：账户配置存储里的交易所账户行（本系统只读，不负责其CRUD）
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct ExchangeAccountEntity {
    /// 所属逻辑用户/交易员
    pub user_id: String,
    /// 交易所账户ID
    pub account_id: String,
    /// 账户名称（用户自定义）
    pub name: String,
    /// 交易所类型，如 binance / binance_futures
    pub exchange_type: String,
    pub api_key: String,
    pub secret_key: String,
    /// 接口域名，空则用交易所默认
    pub endpoint: Option<String>,
}

crud!(ExchangeAccountEntity {}, "exchange_accounts");

pub struct ExchangeAccountModel {
    db: &'static RBatis,
}

impl ExchangeAccountModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    /// 拉取全量账户行，作为本轮凭证解析的只读快照
    pub async fn fetch_all(&self) -> Result<Vec<ExchangeAccountEntity>> {
        let sql = "SELECT user_id, account_id, name, exchange_type, api_key, secret_key, endpoint \
                   FROM exchange_accounts";
        let rows: Vec<ExchangeAccountEntity> = self.db.query_decode(sql, vec![]).await?;
        Ok(rows)
    }
}
