use chrono::{DateTime, Utc};

use crate::app_config::env::{env_f64_or_default, env_i64_or_default};

/// 对账运行参数，全部可通过环境变量覆盖
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// 价格相对误差阈值%，超过才触发纠偏（默认1.0%）
    pub price_tol_pct: f64,
    /// 数量相对误差阈值%（默认1.0%）
    pub qty_tol_pct: f64,
    /// 启发式匹配的时间容差，单位秒（默认±180s）
    pub time_tol_sec: i64,
    /// 预期持仓时长（秒），用于推算开仓对应的预期平仓时间，默认0
    pub expected_hold_secs: i64,
    /// 交易所请求之间的最小间隔（毫秒）
    pub min_request_interval_ms: u64,
    /// 只统计该时间(含)之后的决策
    pub from_time: Option<DateTime<Utc>>,
    /// 只统计该时间(含)之前的决策
    pub to_time: Option<DateTime<Utc>>,
    /// 只报告、不落盘（不补录也不纠偏）
    pub dry_run: bool,
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        Self {
            price_tol_pct: env_f64_or_default("PRICE_TOL_PCT", 1.0),
            qty_tol_pct: env_f64_or_default("QTY_TOL_PCT", 1.0),
            time_tol_sec: env_i64_or_default("TIME_TOL_SEC", 180),
            expected_hold_secs: env_i64_or_default("EXPECTED_HOLD_SECS", 0),
            min_request_interval_ms: env_i64_or_default("MIN_REQUEST_INTERVAL_MS", 300) as u64,
            from_time: None,
            to_time: None,
            dry_run: false,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            price_tol_pct: 1.0,
            qty_tol_pct: 1.0,
            time_tol_sec: 180,
            expected_hold_secs: 0,
            min_request_interval_ms: 300,
            from_time: None,
            to_time: None,
            dry_run: false,
        }
    }
}
