use std::fs;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use order_audit::reconcile::cache::{MemoryReconcileCache, ReconcileCache};
use order_audit::reconcile::config::ReconcileConfig;
use order_audit::reconcile::decision::backup_path;
use order_audit::reconcile::matching::MatchingEngine;
use order_audit::reconcile::model::order::exchange_order::ExchangeOrderEntity;
use order_audit::reconcile::report::RunReport;

const T0_ISO: &str = "2025-11-10T12:00:00Z";
const T0_MS: i64 = 1_762_776_000_000;

fn order(
    order_id: i64,
    side: &str,
    status: &str,
    reduce_only: bool,
    close_position: bool,
    executed_qty: &str,
    avg_price: &str,
    event_time: i64,
) -> ExchangeOrderEntity {
    ExchangeOrderEntity {
        account_id: "acct".to_string(),
        symbol: "BTCUSDT".to_string(),
        order_id,
        side: side.to_string(),
        position_side: "BOTH".to_string(),
        status: status.to_string(),
        reduce_only,
        close_position,
        executed_qty: executed_qty.to_string(),
        avg_price: avg_price.to_string(),
        event_time,
    }
}

fn write_decision(dir: &TempDir, name: &str, decisions: serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let body = json!({"timestamp": T0_ISO, "decisions": decisions});
    fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
    path
}

async fn cache_with(orders: Vec<ExchangeOrderEntity>) -> Arc<dyn ReconcileCache> {
    let cache = MemoryReconcileCache::new();
    cache
        .upsert_orders("acct", "BTCUSDT", &orders)
        .await
        .unwrap();
    Arc::new(cache)
}

fn accounts() -> Vec<String> {
    vec!["acct".to_string()]
}

async fn run_engine(
    cache: Arc<dyn ReconcileCache>,
    dir: &TempDir,
) -> RunReport {
    let engine = MatchingEngine::new(cache, ReconcileConfig::default());
    let mut report = RunReport::new();
    engine
        .reconcile_dir(dir.path(), &accounts(), &mut report)
        .await
        .unwrap();
    report
}

#[tokio::test]
async fn test_within_threshold_is_matched_without_backup() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "close_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 500, "success": true}]),
    );
    // 0.5% 偏差在1%阈值内
    let cache = cache_with(vec![order(500, "SELL", "FILLED", false, false, "1.0", "100.5", T0_MS + 60_000)]).await;

    let report = run_engine(cache, &dir).await;
    assert_eq!(report.matched, 1);
    assert_eq!(report.corrected, 0);
    assert!(!backup_path(&path).exists());
    Ok(())
}

#[tokio::test]
async fn test_deviation_triggers_correction_with_single_backup() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "close_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 500, "success": true}]),
    );
    // 2% 价格偏差触发纠偏
    let cache = cache_with(vec![order(500, "SELL", "FILLED", false, false, "1.0", "102.0", T0_MS + 60_000)]).await;

    let report = run_engine(Arc::clone(&cache), &dir).await;
    assert_eq!(report.corrected, 1);
    assert_eq!(report.matched, 0);
    assert!(backup_path(&path).exists());

    let rewritten: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(rewritten["decisions"][0]["price"], json!(102.0));
    assert_eq!(rewritten["decisions"][0]["reconciliation_state"], json!("corrected"));

    // 第二轮：值已一致，确认matched，不再产生新的改写
    let report = run_engine(cache, &dir).await;
    assert_eq!(report.corrected, 0);
    assert_eq!(report.matched, 1);
    Ok(())
}

#[tokio::test]
async fn test_heuristic_match_without_order_id() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "close_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "success": true}]),
    );
    let cache = cache_with(vec![
        // 时间窗口（±180s）内的FILLED卖单命中
        order(7, "SELL", "FILLED", false, false, "1.0", "100.2", T0_MS + 30_000),
        // 窗口外的不参与
        order(8, "SELL", "FILLED", false, false, "1.0", "150.0", T0_MS + 3_600_000),
        // 方向不符的不参与
        order(9, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS + 10_000),
    ])
    .await;

    let report = run_engine(cache, &dir).await;
    assert_eq!(report.matched, 1);
    assert_eq!(report.unreconciled, 0);
    Ok(())
}

#[tokio::test]
async fn test_synthesis_full_close() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 100, "success": true}]),
    );
    // reduce_only FILLED 且成交量等于开仓数量 → 整体平仓
    let cache = cache_with(vec![
        order(100, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS),
        order(101, "SELL", "FILLED", true, false, "1.0", "101.5", T0_MS + 120_000),
    ])
    .await;

    let report = run_engine(cache, &dir).await;
    assert_eq!(report.matched, 1);
    assert_eq!(report.synthesized, 1);

    let synth_path = dir.path().join("decision_synth_btcusdt_101.json");
    assert!(synth_path.exists());
    let synth: serde_json::Value = serde_json::from_str(&fs::read_to_string(&synth_path)?)?;
    assert_eq!(synth["decisions"][0]["action"], json!("close_long"));
    assert_eq!(synth["decisions"][0]["quantity"], json!(1.0));
    assert_eq!(synth["decisions"][0]["price"], json!(101.5));
    assert_eq!(synth["decisions"][0]["order_id"], json!(101));
    assert_eq!(synth["decisions"][0]["reconciliation_state"], json!("synthesized"));
    Ok(())
}

#[tokio::test]
async fn test_synthesis_partial_close() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 100, "success": true}]),
    );
    // 部分成交、有成交量、数量小于开仓 → partial_close，数量取executed_qty
    let cache = cache_with(vec![
        order(100, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS),
        order(102, "SELL", "PARTIALLY_FILLED", true, false, "0.4", "101.0", T0_MS + 120_000),
    ])
    .await;

    let report = run_engine(cache, &dir).await;
    assert_eq!(report.synthesized, 1);

    let synth_path = dir.path().join("decision_synth_btcusdt_102.json");
    let synth: serde_json::Value = serde_json::from_str(&fs::read_to_string(&synth_path)?)?;
    assert_eq!(synth["decisions"][0]["action"], json!("partial_close"));
    assert_eq!(synth["decisions"][0]["quantity"], json!(0.4));
    Ok(())
}

#[tokio::test]
async fn test_zero_executed_qty_is_not_a_candidate() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 100, "success": true}]),
    );
    // reduce_only + PARTIALLY_FILLED + executed_qty=0 被拒绝
    let cache = cache_with(vec![
        order(100, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS),
        order(103, "SELL", "PARTIALLY_FILLED", true, false, "0", "101.0", T0_MS + 120_000),
    ])
    .await;

    let report = run_engine(cache, &dir).await;
    // 开仓条目本身能对上自己的成交，缺的平仓没有候选
    assert_eq!(report.matched, 1);
    assert_eq!(report.synthesized, 0);
    assert_eq!(report.unreconciled, 1);
    assert!(!dir.path().join("decision_synth_btcusdt_103.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_tie_break_prefers_closer_time_then_qty() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 100, "success": true}]),
    );
    // 两个候选：时间更近的order 202胜出（启发式排序，非正确性保证）
    let cache = cache_with(vec![
        order(100, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS),
        order(201, "SELL", "FILLED", true, false, "1.0", "101.0", T0_MS + 600_000),
        order(202, "SELL", "FILLED", true, false, "1.0", "101.2", T0_MS + 60_000),
    ])
    .await;

    let report = run_engine(cache, &dir).await;
    assert_eq!(report.synthesized, 1);
    assert!(dir.path().join("decision_synth_btcusdt_202.json").exists());
    assert!(!dir.path().join("decision_synth_btcusdt_201.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_second_run_is_idempotent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 100, "success": true}]),
    );
    let cache = cache_with(vec![
        order(100, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS),
        order(101, "SELL", "FILLED", true, false, "1.0", "101.5", T0_MS + 120_000),
    ])
    .await;

    let report = run_engine(Arc::clone(&cache), &dir).await;
    assert_eq!(report.synthesized, 1);
    let files_after_first: Vec<_> = fs::read_dir(dir.path())?.collect();

    // 同一缓存状态上再跑一轮：补录条目与开仓条目都被确认，无新文件
    let report = run_engine(cache, &dir).await;
    assert_eq!(report.synthesized, 0);
    assert_eq!(report.corrected, 0);
    assert_eq!(report.matched, 2);
    assert_eq!(report.unreconciled, 0);
    let files_after_second: Vec<_> = fs::read_dir(dir.path())?.collect();
    assert_eq!(files_after_first.len(), files_after_second.len());
    Ok(())
}

#[tokio::test]
async fn test_open_without_any_close_order_stays_unreconciled() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 100, "success": true}]),
    );
    // 缓存里只有开仓方向的订单，没有平仓类订单
    let cache = cache_with(vec![order(100, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS)]).await;

    let report = run_engine(cache, &dir).await;
    // 开仓成交本身对得上，缺失的平仓保持未对上
    assert_eq!(report.matched, 1);
    assert_eq!(report.unreconciled, 1);
    assert_eq!(report.synthesized, 0);
    Ok(())
}

#[tokio::test]
async fn test_open_entry_deviation_is_corrected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 100, "success": true}]),
    );
    // 开仓成交均价偏离2%：开仓条目也要纠偏，不只是平仓
    let cache = cache_with(vec![
        order(100, "BUY", "FILLED", false, false, "1.0", "102.0", T0_MS),
        order(101, "SELL", "FILLED", true, false, "1.0", "102.5", T0_MS + 120_000),
    ])
    .await;

    let report = run_engine(cache, &dir).await;
    assert_eq!(report.corrected, 1);
    assert!(backup_path(&path).exists());
    let rewritten: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(rewritten["decisions"][0]["price"], json!(102.0));
    assert_eq!(rewritten["decisions"][0]["reconciliation_state"], json!("corrected"));
    Ok(())
}

#[tokio::test]
async fn test_open_heuristic_rejects_conflicting_position_side() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "open_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "success": true}]),
    );
    // 方向与状态都吻合，但持仓方向是SHORT，不是open_long的成交
    let mut short_fill = order(300, "BUY", "FILLED", false, false, "1.0", "100.0", T0_MS + 30_000);
    short_fill.position_side = "SHORT".to_string();
    let cache = cache_with(vec![short_fill]).await;

    let report = run_engine(cache, &dir).await;
    assert_eq!(report.matched, 0);
    // 开仓成交没对上，缺失平仓也没有候选
    assert_eq!(report.unreconciled, 2);
    Ok(())
}

#[tokio::test]
async fn test_detail_csv_written_per_decision() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    write_decision(
        &dir,
        "decision_1.json",
        json!([{"action": "close_long", "symbol": "BTCUSDT", "price": 100.0, "quantity": 1.0,
                "order_id": 500, "success": true}]),
    );
    let cache = cache_with(vec![order(500, "SELL", "FILLED", false, false, "1.0", "102.0", T0_MS + 60_000)]).await;

    let report = run_engine(cache, &dir).await;
    report.write_reports(dir.path())?;

    let csv_path = dir.path().join("reports").join("reconcile_detail.csv");
    let content = fs::read_to_string(&csv_path)?;
    let mut lines = content.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("ts,symbol,action,decision_price"));
    let row = lines.next().unwrap();
    assert!(row.contains("close_long"));
    assert!(row.contains("order_id"));
    assert!(row.contains("corrected"));
    // 价格偏差 |100-102|/102 写进明细
    assert!(row.contains("1.9608%"));
    assert!(dir.path().join("reports").join("reconcile_summary.md").exists());
    Ok(())
}
