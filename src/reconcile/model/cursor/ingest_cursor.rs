extern crate rbatis;

use anyhow::Result;
use rbatis::rbdc::db::ExecResult;
use rbatis::{crud, RBatis};
use serde::{Deserialize, Serialize};

use crate::app_config::db;

/// table：增量摄取游标，每个(账户,交易对)一行
/// 只允许单调前进，全量重拉需要运维手工清表，程序内不会重置
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct IngestCursorEntity {
    pub account_id: String,
    pub symbol: String,
    pub last_order_id: i64,
}

crud!(IngestCursorEntity {}, "ingest_cursors");

pub struct IngestCursorModel {
    db: &'static RBatis,
}

impl IngestCursorModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn create_table(&self) -> Result<ExecResult> {
        let create_table_sql = "CREATE TABLE IF NOT EXISTS `ingest_cursors` (
            `id` bigint NOT NULL AUTO_INCREMENT,
            `account_id` varchar(64) NOT NULL,
            `symbol` varchar(32) NOT NULL,
            `last_order_id` bigint NOT NULL DEFAULT 0 COMMENT '已摄取的最大订单ID',
            `updated_at` datetime DEFAULT NULL ON UPDATE CURRENT_TIMESTAMP,
            PRIMARY KEY (`id`),
            UNIQUE KEY `uk_account_symbol` (`account_id`,`symbol`)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_0900_ai_ci;";
        let res = self.db.exec(create_table_sql, vec![]).await?;
        Ok(res)
    }

    /// 未摄取过的key返回0
    pub async fn get(&self, account_id: &str, symbol: &str) -> Result<i64> {
        let sql = "SELECT last_order_id FROM ingest_cursors WHERE account_id = ? AND symbol = ?";
        let row: Option<i64> = self
            .db
            .query_decode(sql, vec![account_id.into(), symbol.into()])
            .await?;
        Ok(row.unwrap_or(0))
    }

    /// 单调前进：只接受更大的order_id，传入更小的值是no-op
    pub async fn advance(&self, account_id: &str, symbol: &str, order_id: i64) -> Result<()> {
        let sql = "INSERT INTO ingest_cursors (account_id, symbol, last_order_id) VALUES (?, ?, ?) \
                   ON DUPLICATE KEY UPDATE last_order_id = GREATEST(last_order_id, VALUES(last_order_id))";
        self.db
            .exec(
                sql,
                vec![account_id.into(), symbol.into(), order_id.into()],
            )
            .await?;
        Ok(())
    }
}
