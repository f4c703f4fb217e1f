use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::time_util;

/// 执行成功日志行的兜底识别格式，与上游程序的 execution_log 写法对齐
static EXEC_LOG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[✓✔]\s*([A-Z0-9]+USDT)\s+(open_long|open_short|close_long|close_short)\s*成功")
        .expect("exec log regex")
});

/// 决策动作
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    PartialClose,
}

impl DecisionAction {
    pub fn is_open(&self) -> bool {
        matches!(self, DecisionAction::OpenLong | DecisionAction::OpenShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(
            self,
            DecisionAction::CloseLong | DecisionAction::CloseShort | DecisionAction::PartialClose
        )
    }

    /// 多头方向：open_long 的持仓用 close_long / partial_close 了结
    pub fn is_long_side(&self) -> bool {
        matches!(self, DecisionAction::OpenLong | DecisionAction::CloseLong)
    }

    /// 日志里的snake_case写法
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::OpenLong => "open_long",
            DecisionAction::OpenShort => "open_short",
            DecisionAction::CloseLong => "close_long",
            DecisionAction::CloseShort => "close_short",
            DecisionAction::PartialClose => "partial_close",
        }
    }
}

/// 对账状态
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Unreconciled,
    Matched,
    Synthesized,
    Corrected,
}

/// 一条决策记录（decision_*.json 里 decisions 数组的元素）
/// extra 保留上游程序写入的其他字段，改写时原样带回
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DecisionRecord {
    pub action: DecisionAction,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation_state: Option<ReconcileState>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// 一个决策日志文件
/// decisions 以原始Value保存：单条记录解析失败或动作未知时跳过该条，
/// 不影响同文件其他记录，改写时也不丢字段
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DecisionFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub decisions: Vec<Value>,
    /// 执行日志行，decisions缺记录时兜底识别成功动作
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_log: Vec<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// 日志集中一条待对账条目，(文件,下标)唯一定位
#[derive(Debug, Clone)]
pub struct DecisionEntry {
    pub path: PathBuf,
    pub index: usize,
    pub ts: DateTime<Utc>,
    pub record: DecisionRecord,
}

/// 单个文件解析出的条目与失败计数
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub entries: Vec<DecisionEntry>,
    pub parse_failures: Vec<String>,
}

fn is_decision_file(name: &str) -> bool {
    name.starts_with("decision_") && name.ends_with(".json")
}

/// 扫描目录下的 decision_*.json，解析为待对账条目
/// 单文件解析失败只记录并跳过，不中断整轮
pub fn load_dir(logs_dir: &Path) -> Result<LoadOutcome, AppError> {
    let mut outcome = LoadOutcome::default();
    let mut paths: Vec<PathBuf> = fs::read_dir(logs_dir)
        .map_err(|e| AppError::ParseError(format!("读取日志目录失败 {}: {}", logs_dir.display(), e)))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(is_decision_file)
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        match load_file(&path) {
            Ok(mut entries) => outcome.entries.append(&mut entries),
            Err(e) => {
                warn!("跳过无法解析的日志文件 {}: {}", path.display(), e);
                outcome.parse_failures.push(format!("{}: {}", path.display(), e));
            }
        }
    }
    Ok(outcome)
}

fn load_file(path: &Path) -> Result<Vec<DecisionEntry>, AppError> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::ParseError(format!("读取失败: {}", e)))?;
    let file: DecisionFile = serde_json::from_str(&content)?;

    // 基准时间：文件里的timestamp（ISO或epoch都认）；缺失或非法时回退到文件修改时间
    let base_ts = file
        .timestamp
        .as_deref()
        .and_then(time_util::parse_flexible_ts)
        .or_else(|| {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        })
        .unwrap_or_else(Utc::now);

    let mut entries = Vec::new();
    for (index, raw) in file.decisions.iter().enumerate() {
        let record: DecisionRecord = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(e) => {
                // hold/wait等非交易动作也会走到这里，静默跳过
                debug!("跳过decisions[{}] in {}: {}", index, path.display(), e);
                continue;
            }
        };
        // 只有执行成功的动作才有交易所订单可对
        if !record.success {
            continue;
        }
        let ts = record
            .timestamp
            .as_deref()
            .and_then(time_util::parse_flexible_ts)
            .unwrap_or(base_ts);
        entries.push(DecisionEntry {
            path: path.to_path_buf(),
            index,
            ts,
            record,
        });
    }

    // 兜底：decisions里没有的成功动作，从execution_log行里识别
    // 这类条目没有价格数量，只参与找单确认，不会触发纠偏改写
    for (line_no, line) in file.execution_log.iter().enumerate() {
        let line = match line.as_str() {
            Some(s) => s,
            None => continue,
        };
        let caps = match EXEC_LOG_RE.captures(line) {
            Some(c) => c,
            None => continue,
        };
        let symbol = caps[1].to_string();
        let action: DecisionAction = match serde_json::from_value(Value::String(caps[2].to_string()))
        {
            Ok(a) => a,
            Err(_) => continue,
        };
        // decisions 已包含同一(动作,交易对)且时间接近时以decisions为准
        let duplicated = entries.iter().any(|e| {
            e.record.symbol == symbol
                && e.record.action == action
                && (e.ts - base_ts).num_seconds().abs() < 600
        });
        if duplicated {
            continue;
        }
        entries.push(DecisionEntry {
            path: path.to_path_buf(),
            // 不对应decisions数组的任何下标，仅用于日志定位
            index: file.decisions.len() + line_no,
            ts: base_ts,
            record: DecisionRecord {
                action,
                symbol,
                price: None,
                quantity: None,
                order_id: None,
                success: true,
                timestamp: None,
                reconciliation_state: None,
                extra: serde_json::Map::new(),
            },
        });
    }
    Ok(entries)
}

/// 备份文件路径：原文件名 + .bak 后缀
pub fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// 先写临时文件再rename覆盖，写到一半失败不会留下半个目标文件
fn write_atomic(path: &Path, content: &str) -> Result<(), AppError> {
    let tmp = tmp_path(path);
    fs::write(&tmp, content)
        .map_err(|e| AppError::WriteError(format!("写临时文件失败 {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| AppError::WriteError(format!("覆盖失败 {}: {}", path.display(), e)))
}

/// 纠偏改写：先备份再覆写，备份一经存在绝不覆盖或删除
/// 任一失败路径上原文件与既有备份保持原状
pub fn apply_correction(
    path: &Path,
    index: usize,
    new_price: f64,
    new_qty: f64,
) -> Result<PathBuf, AppError> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::ParseError(format!("读取失败 {}: {}", path.display(), e)))?;
    let mut root: Value = serde_json::from_str(&content)?;

    {
        let decision = root
            .get_mut("decisions")
            .and_then(|d| d.get_mut(index))
            .ok_or_else(|| {
                AppError::ParseError(format!("decisions[{}] 不存在: {}", index, path.display()))
            })?;
        let obj = decision.as_object_mut().ok_or_else(|| {
            AppError::ParseError(format!("decisions[{}] 不是对象: {}", index, path.display()))
        })?;
        obj.insert("price".to_string(), serde_json::json!(new_price));
        obj.insert("quantity".to_string(), serde_json::json!(new_qty));
        obj.insert(
            "reconciliation_state".to_string(),
            serde_json::json!(ReconcileState::Corrected),
        );
    }

    // 每个纠偏事件至多产生一个备份：首个改写前快照保留
    let bak = backup_path(path);
    if !bak.exists() {
        fs::copy(path, &bak)
            .map_err(|e| AppError::WriteError(format!("备份失败 {}: {}", bak.display(), e)))?;
    }
    let serialized = serde_json::to_string_pretty(&root)?;
    write_atomic(path, &serialized)?;
    Ok(bak)
}

/// 补录：为缺失的平仓动作生成一个新的单决策文件
/// 文件名按(交易对,订单ID)确定，已存在则视为上轮已补录，直接返回
pub fn write_synthesized(
    logs_dir: &Path,
    record: &DecisionRecord,
    event_time_ms: i64,
) -> Result<PathBuf, AppError> {
    let order_id = record.order_id.unwrap_or(0);
    let path = logs_dir.join(format!(
        "decision_synth_{}_{}.json",
        record.symbol.to_lowercase(),
        order_id
    ));
    if path.exists() {
        debug!("补录文件已存在，跳过: {}", path.display());
        return Ok(path);
    }
    let timestamp = time_util::millis_to_utc(event_time_ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339();
    let file = DecisionFile {
        timestamp: Some(timestamp),
        decisions: vec![serde_json::to_value(record)?],
        execution_log: Vec::new(),
        extra: serde_json::Map::new(),
    };
    let serialized = serde_json::to_string_pretty(&file)?;
    write_atomic(&path, &serialized)?;
    Ok(path)
}
