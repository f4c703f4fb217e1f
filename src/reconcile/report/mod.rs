use std::fs;
use std::path::Path;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::time_util;

/// 单项失败/未决事项，聚合进末轮报告，不中断批处理
#[derive(Debug, Clone)]
pub enum ReportItem {
    CredentialFailure { trader_id: String, detail: String },
    FetchFailure { account_id: String, symbol: String, detail: String },
    ParseFailure { detail: String },
    WriteFailure { path: String, detail: String },
    /// 没有候选订单，条目保持unreconciled等待下一轮
    NoCandidate { symbol: String, action: String, ts: String },
}

impl ReportItem {
    fn describe(&self) -> String {
        match self {
            ReportItem::CredentialFailure { trader_id, detail } => {
                format!("凭证: trader={} → {}", trader_id, detail)
            }
            ReportItem::FetchFailure {
                account_id,
                symbol,
                detail,
            } => format!("拉取: {}:{} → {}", account_id, symbol, detail),
            ReportItem::ParseFailure { detail } => format!("解析: {}", detail),
            ReportItem::WriteFailure { path, detail } => {
                format!("写入: {} → {}", path, detail)
            }
            ReportItem::NoCandidate { symbol, action, ts } => {
                format!("无候选订单: {} {} {}", ts, symbol, action)
            }
        }
    }
}

/// 明细CSV的一行：一条决策与其命中订单的逐字段对照
/// 空串表示该字段缺失或无订单可对
#[derive(Debug, Clone, Default)]
pub struct DetailRow {
    pub ts: String,
    pub symbol: String,
    pub action: String,
    pub decision_price: String,
    pub decision_qty: String,
    pub decision_order_id: String,
    pub order_time: String,
    pub order_id: String,
    pub side: String,
    pub position_side: String,
    pub reduce_only: String,
    pub avg_price: String,
    pub executed_qty: String,
    pub price_diff_pct: String,
    pub qty_diff_pct: String,
    pub outcome: String,
    /// order_id / time_window / not_found
    pub match_method: String,
}

/// 一轮对账的汇总报告
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: chrono::DateTime<Utc>,
    pub entries_seen: usize,
    pub matched: usize,
    pub corrected: usize,
    pub synthesized: usize,
    pub unreconciled: usize,
    pub orders_ingested: usize,
    pub items: Vec<ReportItem>,
    pub details: Vec<DetailRow>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            entries_seen: 0,
            matched: 0,
            corrected: 0,
            synthesized: 0,
            unreconciled: 0,
            orders_ingested: 0,
            items: Vec::new(),
            details: Vec::new(),
        }
    }

    pub fn record(&mut self, item: ReportItem) {
        self.items.push(item);
    }

    pub fn record_detail(&mut self, row: DetailRow) {
        self.details.push(row);
    }

    pub fn failure_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| !matches!(i, ReportItem::NoCandidate { .. }))
            .count()
    }

    /// 汇总与明细落盘到 <logs_dir>/reports/ 下，并打一条汇总日志
    pub fn write_reports(&self, logs_dir: &Path) -> Result<(), AppError> {
        let report_dir = logs_dir.join("reports");
        fs::create_dir_all(&report_dir)
            .map_err(|e| AppError::WriteError(format!("创建报告目录失败: {}", e)))?;
        self.write_detail_csv(&report_dir)?;
        let path = report_dir.join("reconcile_summary.md");

        let started_cn = time_util::mill_time_to_datetime_shanghai(
            self.started_at.timestamp_millis(),
        )
        .unwrap_or_default();
        let mut body = String::new();
        body.push_str("# 订单与决策日志对账摘要\n\n");
        body.push_str(&format!("- run_id: {}\n", self.run_id));
        body.push_str(&format!(
            "- 开始时间: {} ({} 东八区)\n",
            self.started_at.to_rfc3339(),
            started_cn
        ));
        body.push_str(&format!("- 决策条目数: {}\n", self.entries_seen));
        body.push_str(&format!("- 确认一致: {}\n", self.matched));
        body.push_str(&format!("- 纠偏: {}\n", self.corrected));
        body.push_str(&format!("- 补录: {}\n", self.synthesized));
        body.push_str(&format!("- 仍未对上: {}\n", self.unreconciled));
        body.push_str(&format!("- 本轮入缓存订单数: {}\n", self.orders_ingested));
        body.push_str(&format!("- 单项失败数: {}\n", self.failure_count()));
        body.push_str("\n## 异常与未决明细（最多前100条）\n\n");
        for item in self.items.iter().take(100) {
            body.push_str(&format!("- {}\n", item.describe()));
        }

        fs::write(&path, body)
            .map_err(|e| AppError::WriteError(format!("写报告失败 {}: {}", path.display(), e)))?;
        info!(
            "对账完成 run_id={} 条目={} 一致={} 纠偏={} 补录={} 未对上={} 失败={}",
            self.run_id,
            self.entries_seen,
            self.matched,
            self.corrected,
            self.synthesized,
            self.unreconciled,
            self.failure_count()
        );
        Ok(())
    }

    /// 逐决策明细，列结构对齐历史的人工核对表
    fn write_detail_csv(&self, report_dir: &Path) -> Result<(), AppError> {
        let path = report_dir.join("reconcile_detail.csv");
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| AppError::WriteError(format!("写CSV失败 {}: {}", path.display(), e)))?;
        writer
            .write_record([
                "ts",
                "symbol",
                "action",
                "decision_price",
                "decision_qty",
                "decision_order_id",
                "order_time",
                "order_id",
                "side",
                "position_side",
                "reduce_only",
                "avg_price",
                "executed_qty",
                "price_diff_pct",
                "qty_diff_pct",
                "outcome",
                "match_method",
            ])
            .map_err(|e| AppError::WriteError(format!("写CSV失败: {}", e)))?;
        for row in &self.details {
            writer
                .write_record([
                    row.ts.as_str(),
                    row.symbol.as_str(),
                    row.action.as_str(),
                    row.decision_price.as_str(),
                    row.decision_qty.as_str(),
                    row.decision_order_id.as_str(),
                    row.order_time.as_str(),
                    row.order_id.as_str(),
                    row.side.as_str(),
                    row.position_side.as_str(),
                    row.reduce_only.as_str(),
                    row.avg_price.as_str(),
                    row.executed_qty.as_str(),
                    row.price_diff_pct.as_str(),
                    row.qty_diff_pct.as_str(),
                    row.outcome.as_str(),
                    row.match_method.as_str(),
                ])
                .map_err(|e| AppError::WriteError(format!("写CSV失败: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| AppError::WriteError(format!("写CSV失败: {}", e)))
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}
