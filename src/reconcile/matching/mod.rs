use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::reconcile::cache::ReconcileCache;
use crate::reconcile::config::ReconcileConfig;
use crate::reconcile::decision::{
    self, DecisionAction, DecisionEntry, DecisionRecord, ReconcileState,
};
use crate::reconcile::model::order::exchange_order::{ExchangeOrderEntity, OrderQuery};
use crate::reconcile::report::{DetailRow, ReportItem, RunReport};

const STATUS_FILLED: &str = "FILLED";
const STATUS_PARTIALLY_FILLED: &str = "PARTIALLY_FILLED";
const STATUS_CANCELED: &str = "CANCELED";

/// 匹配引擎：对每条未对账条目做三选一——确认一致、补录缺失平仓、纠偏
/// 从不删除日志条目；所有落盘改写都先备份
pub struct MatchingEngine {
    cache: Arc<dyn ReconcileCache>,
    config: ReconcileConfig,
}

/// 平仓订单是否满足部分平仓候选条件
/// FILLED无条件接受；PARTIALLY_FILLED/CANCELED仅在有成交量时接受
pub fn qualifies_partial_close(order: &ExchangeOrderEntity) -> bool {
    if !order.reduce_only {
        return false;
    }
    match order.status.as_str() {
        STATUS_FILLED => true,
        STATUS_PARTIALLY_FILLED | STATUS_CANCELED => order.executed_qty_f64() > 0.0,
        _ => false,
    }
}

/// 相对偏差是否超过阈值（%）；没有记录值或订单值为0时不触发
pub fn deviation_exceeds(logged: Option<f64>, actual: f64, tol_pct: f64) -> bool {
    match logged {
        Some(logged) => {
            if actual == 0.0 {
                return false;
            }
            (logged - actual).abs() / actual.abs() * 100.0 > tol_pct
        }
        None => false,
    }
}

/// 开仓动作对应的平仓订单方向：多头开仓用SELL了结，空头用BUY
fn close_side_for_open(open_action: DecisionAction) -> &'static str {
    if open_action.is_long_side() {
        "SELL"
    } else {
        "BUY"
    }
}

/// 决策动作对应的订单方向（open_long → BUY，close_long → SELL）
/// partial_close不约束方向
fn side_for_action(action: DecisionAction) -> Option<&'static str> {
    match action {
        DecisionAction::OpenLong => Some("BUY"),
        DecisionAction::OpenShort => Some("SELL"),
        DecisionAction::CloseLong => Some("SELL"),
        DecisionAction::CloseShort => Some("BUY"),
        DecisionAction::PartialClose => None,
    }
}

/// 决策动作期望的持仓方向；partial_close不约束
fn expected_position_side(action: DecisionAction) -> Option<&'static str> {
    match action {
        DecisionAction::OpenLong | DecisionAction::CloseLong => Some("LONG"),
        DecisionAction::OpenShort | DecisionAction::CloseShort => Some("SHORT"),
        DecisionAction::PartialClose => None,
    }
}

/// 单向持仓模式下交易所返回BOTH，视为不冲突
fn position_side_ok(order: &ExchangeOrderEntity, expected: Option<&str>) -> bool {
    match expected {
        Some(ps) => order.position_side == ps || order.position_side == "BOTH",
        None => true,
    }
}

/// 候选排序：先看与预期时间的距离，再看与预期数量的距离
/// 这是对多对多歧义的尽力启发，不保证全局正确
fn pick_best<'a>(
    candidates: &'a [ExchangeOrderEntity],
    expected_ts_ms: i64,
    expected_qty: Option<f64>,
) -> Option<&'a ExchangeOrderEntity> {
    candidates.iter().min_by(|a, b| {
        let da = (a.event_time - expected_ts_ms).abs();
        let db = (b.event_time - expected_ts_ms).abs();
        da.cmp(&db).then_with(|| {
            let qty = expected_qty.unwrap_or(0.0);
            let qa = (a.executed_qty_f64() - qty).abs();
            let qb = (b.executed_qty_f64() - qty).abs();
            qa.partial_cmp(&qb).unwrap_or(std::cmp::Ordering::Equal)
        })
    })
}

impl MatchingEngine {
    pub fn new(cache: Arc<dyn ReconcileCache>, config: ReconcileConfig) -> Self {
        Self { cache, config }
    }

    /// 对一个交易员日志目录跑一轮匹配
    /// account_ids 按凭证回退链的顺序给出，逐个搜索，先命中者胜
    /// 条目级失败全部聚合进报告，只有缓存不可用才向上冒错
    pub async fn reconcile_dir(
        &self,
        logs_dir: &Path,
        account_ids: &[String],
        report: &mut RunReport,
    ) -> Result<()> {
        let outcome = decision::load_dir(logs_dir)?;
        for detail in outcome.parse_failures {
            report.record(ReportItem::ParseFailure { detail });
        }

        let entries: Vec<DecisionEntry> = outcome
            .entries
            .into_iter()
            .filter(|e| self.in_time_range(e.ts))
            .collect();
        report.entries_seen += entries.len();

        // 先核对平仓条目，再核对开仓条目；没有平仓记录的开仓额外做补录
        for entry in entries.iter().filter(|e| e.record.action.is_close()) {
            self.reconcile_entry(entry, account_ids, report).await?;
        }
        for entry in entries.iter().filter(|e| e.record.action.is_open()) {
            self.reconcile_entry(entry, account_ids, report).await?;
            if has_later_close(&entries, entry) {
                continue;
            }
            self.synthesize_for_open(logs_dir, entry, account_ids, report)
                .await?;
        }
        Ok(())
    }

    fn in_time_range(&self, ts: DateTime<Utc>) -> bool {
        if let Some(from) = self.config.from_time {
            if ts < from {
                return false;
            }
        }
        if let Some(to) = self.config.to_time {
            if ts > to {
                return false;
            }
        }
        true
    }

    /// 开仓与平仓条目通用：找到对应订单后核对价格/数量，超阈值则备份+改写
    async fn reconcile_entry(
        &self,
        entry: &DecisionEntry,
        account_ids: &[String],
        report: &mut RunReport,
    ) -> Result<()> {
        let record = &entry.record;
        let (order, method) = match self.find_order_for_entry(entry, account_ids).await? {
            Some(hit) => hit,
            None => {
                report.unreconciled += 1;
                report.record(ReportItem::NoCandidate {
                    symbol: record.symbol.clone(),
                    action: record.action.as_str().to_string(),
                    ts: entry.ts.to_rfc3339(),
                });
                report.record_detail(detail_row(entry, None, "not_found", "unreconciled"));
                return Ok(());
            }
        };

        let avg_price = order.avg_price_f64();
        let executed_qty = order.executed_qty_f64();
        let price_off = deviation_exceeds(record.price, avg_price, self.config.price_tol_pct);
        let qty_off = deviation_exceeds(record.quantity, executed_qty, self.config.qty_tol_pct);

        if !price_off && !qty_off {
            report.matched += 1;
            report.record_detail(detail_row(entry, Some(&order), method, "matched"));
            debug!(
                "确认一致 {} {:?} order_id={}",
                record.symbol, record.action, order.order_id
            );
            return Ok(());
        }

        if self.config.dry_run {
            info!(
                "dry-run 跳过纠偏 {} decisions[{}] → price={} qty={}",
                entry.path.display(),
                entry.index,
                avg_price,
                executed_qty
            );
            report.corrected += 1;
            report.record_detail(detail_row(entry, Some(&order), method, "corrected"));
            return Ok(());
        }
        match decision::apply_correction(&entry.path, entry.index, avg_price, executed_qty) {
            Ok(bak) => {
                report.corrected += 1;
                report.record_detail(detail_row(entry, Some(&order), method, "corrected"));
                info!(
                    "纠偏 {} decisions[{}] order_id={} 备份={}",
                    entry.path.display(),
                    entry.index,
                    order.order_id,
                    bak.display()
                );
            }
            Err(e) => {
                // 写失败不重试，条目保持改写前状态，下一轮再处理
                warn!("纠偏写入失败 {}: {}", entry.path.display(), e);
                report.record_detail(detail_row(entry, Some(&order), method, "write_failed"));
                report.record(ReportItem::WriteFailure {
                    path: entry.path.display().to_string(),
                    detail: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// 为条目定位订单：先按order_id精确匹配，再退化为时间窗口启发式
    /// 按回退链顺序逐账户搜索，先命中者胜；返回订单与匹配方式
    async fn find_order_for_entry(
        &self,
        entry: &DecisionEntry,
        account_ids: &[String],
    ) -> Result<Option<(ExchangeOrderEntity, &'static str)>> {
        let record = &entry.record;
        for account_id in account_ids {
            let all = self
                .cache
                .query_orders(account_id, &record.symbol, &OrderQuery::default())
                .await?;

            // 1) order_id 精确匹配
            if let Some(order_id) = record.order_id {
                if let Some(order) = all.iter().find(|o| o.order_id == order_id) {
                    return Ok(Some((order.clone(), "order_id")));
                }
            }

            // 2) 时间窗口启发式，持仓方向冲突的订单不参与
            let entry_ms = entry.ts.timestamp_millis();
            let tol_ms = self.config.time_tol_sec * 1000;
            let expected_ps = expected_position_side(record.action);
            let window: Vec<ExchangeOrderEntity> = all
                .into_iter()
                .filter(|o| (o.event_time - entry_ms).abs() <= tol_ms)
                .filter(|o| position_side_ok(o, expected_ps))
                .collect();

            let candidates: Vec<ExchangeOrderEntity> = match record.action {
                // 开仓：方向一致、非平仓类、FILLED
                DecisionAction::OpenLong | DecisionAction::OpenShort => {
                    let side = side_for_action(record.action).unwrap_or("BUY");
                    window
                        .into_iter()
                        .filter(|o| {
                            o.side == side
                                && o.status == STATUS_FILLED
                                && !o.reduce_only
                                && !o.close_position
                        })
                        .collect()
                }
                // 整体平仓：方向与开仓相反、FILLED
                DecisionAction::CloseLong | DecisionAction::CloseShort => {
                    let side = side_for_action(record.action).unwrap_or("SELL");
                    window
                        .into_iter()
                        .filter(|o| o.side == side && o.status == STATUS_FILLED)
                        .collect()
                }
                // 部分平仓：reduce_only候选规则，方向未知时不约束
                DecisionAction::PartialClose => window
                    .into_iter()
                    .filter(qualifies_partial_close)
                    .collect(),
            };
            if let Some(best) = pick_best(&candidates, entry_ms, record.quantity) {
                return Ok(Some((best.clone(), "time_window")));
            }
        }
        Ok(None)
    }

    /// 开仓无平仓记录：在缓存里找合格的平仓类订单，补录一条决策
    async fn synthesize_for_open(
        &self,
        logs_dir: &Path,
        entry: &DecisionEntry,
        account_ids: &[String],
        report: &mut RunReport,
    ) -> Result<()> {
        let record = &entry.record;
        let open_ms = entry.ts.timestamp_millis();
        let close_side = close_side_for_open(record.action);

        // 平仓类订单：reduce_only 或 close_position，方向与开仓相反，时间在开仓之后
        let filter = OrderQuery {
            side: Some(close_side.to_string()),
            begin_ts: Some(open_ms + 1),
            end_ts: self.config.to_time.map(|t| t.timestamp_millis()),
            ..Default::default()
        };
        let mut candidates: Vec<ExchangeOrderEntity> = Vec::new();
        for account_id in account_ids {
            candidates = self
                .cache
                .query_orders(account_id, &record.symbol, &filter)
                .await?
                .into_iter()
                .filter(|o| position_side_ok(o, expected_position_side(record.action)))
                .filter(|o| {
                    (o.close_position && o.status == STATUS_FILLED) || qualifies_partial_close(o)
                })
                .collect();
            if !candidates.is_empty() {
                break;
            }
        }

        let expected_ms = open_ms + self.config.expected_hold_secs * 1000;
        let order = match pick_best(&candidates, expected_ms, record.quantity) {
            Some(o) => o.clone(),
            None => {
                report.unreconciled += 1;
                report.record(ReportItem::NoCandidate {
                    symbol: record.symbol.clone(),
                    action: record.action.as_str().to_string(),
                    ts: entry.ts.to_rfc3339(),
                });
                return Ok(());
            }
        };

        let executed_qty = order.executed_qty_f64();
        let full_close = self.is_full_close(&order, record.quantity);
        let action = if full_close {
            if record.action.is_long_side() {
                DecisionAction::CloseLong
            } else {
                DecisionAction::CloseShort
            }
        } else {
            DecisionAction::PartialClose
        };

        let synthesized = DecisionRecord {
            action,
            symbol: record.symbol.clone(),
            price: Some(order.avg_price_f64()),
            quantity: Some(executed_qty),
            order_id: Some(order.order_id),
            success: true,
            timestamp: crate::time_util::millis_to_utc(order.event_time).map(|t| t.to_rfc3339()),
            reconciliation_state: Some(ReconcileState::Synthesized),
            extra: serde_json::Map::new(),
        };

        if self.config.dry_run {
            info!(
                "dry-run 跳过补录 {} {:?} order_id={}",
                synthesized.symbol, synthesized.action, order.order_id
            );
            report.synthesized += 1;
            return Ok(());
        }
        match decision::write_synthesized(logs_dir, &synthesized, order.event_time) {
            Ok(path) => {
                report.synthesized += 1;
                info!(
                    "补录 {} {:?} order_id={} → {}",
                    synthesized.symbol,
                    synthesized.action,
                    order.order_id,
                    path.display()
                );
            }
            Err(e) => {
                warn!("补录写入失败 {}: {}", synthesized.symbol, e);
                report.record(ReportItem::WriteFailure {
                    path: logs_dir.display().to_string(),
                    detail: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// 整体平仓判定：close_position订单，或FILLED且成交量覆盖开仓数量（数量阈值内）
    fn is_full_close(&self, order: &ExchangeOrderEntity, open_qty: Option<f64>) -> bool {
        if order.close_position && order.status == STATUS_FILLED {
            return true;
        }
        if order.status != STATUS_FILLED {
            return false;
        }
        match open_qty {
            Some(open_qty) if open_qty > 0.0 => {
                let executed = order.executed_qty_f64();
                executed >= open_qty
                    || (executed - open_qty).abs() / open_qty * 100.0 <= self.config.qty_tol_pct
            }
            // 开仓数量未知时，FILLED视为整体平仓
            _ => true,
        }
    }
}

fn fmt_opt_f64(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// 相对偏差百分比的展示值；任一侧缺失时为空串
fn diff_pct(logged: Option<f64>, actual: f64) -> String {
    match logged {
        Some(logged) if actual != 0.0 => {
            format!("{:.4}%", (logged - actual).abs() / actual.abs() * 100.0)
        }
        _ => String::new(),
    }
}

/// 明细CSV行：决策字段与命中订单字段逐列对照
fn detail_row(
    entry: &DecisionEntry,
    order: Option<&ExchangeOrderEntity>,
    method: &str,
    outcome: &str,
) -> DetailRow {
    let record = &entry.record;
    let mut row = DetailRow {
        ts: entry.ts.to_rfc3339(),
        symbol: record.symbol.clone(),
        action: record.action.as_str().to_string(),
        decision_price: fmt_opt_f64(record.price),
        decision_qty: fmt_opt_f64(record.quantity),
        decision_order_id: record.order_id.map(|id| id.to_string()).unwrap_or_default(),
        outcome: outcome.to_string(),
        match_method: method.to_string(),
        ..Default::default()
    };
    if let Some(order) = order {
        row.order_time =
            crate::time_util::mill_time_to_datetime(order.event_time).unwrap_or_default();
        row.order_id = order.order_id.to_string();
        row.side = order.side.clone();
        row.position_side = order.position_side.clone();
        row.reduce_only = order.reduce_only.to_string();
        row.avg_price = order.avg_price.clone();
        row.executed_qty = order.executed_qty.clone();
        row.price_diff_pct = diff_pct(record.price, order.avg_price_f64());
        row.qty_diff_pct = diff_pct(record.quantity, order.executed_qty_f64());
    }
    row
}

/// 同一交易对上，开仓之后是否已有对应方向的平仓条目（含上轮补录的）
fn has_later_close(entries: &[DecisionEntry], open: &DecisionEntry) -> bool {
    entries.iter().any(|e| {
        e.record.symbol == open.record.symbol
            && e.record.action.is_close()
            && e.ts >= open.ts
            && match e.record.action {
                DecisionAction::CloseLong => open.record.action == DecisionAction::OpenLong,
                DecisionAction::CloseShort => open.record.action == DecisionAction::OpenShort,
                // 部分平仓方向未知，两种开仓都算被覆盖
                _ => true,
            }
    })
}
