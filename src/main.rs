use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use dotenv::dotenv;
use futures::future::join_all;
use tracing::{error, info, warn};

use order_audit::app_config::db::init_db;
use order_audit::app_config::log::setup_logging;
use order_audit::error::AppError;
use order_audit::reconcile::cache::{memory_cache, DbReconcileCache, ReconcileCache};
use order_audit::reconcile::config::ReconcileConfig;
use order_audit::reconcile::credential::{
    self, CredentialStoreSnapshot, ResolveRequest, ResolvedAccount,
};
use order_audit::reconcile::decision;
use order_audit::reconcile::ingest::OrderIngestor;
use order_audit::reconcile::matching::MatchingEngine;
use order_audit::reconcile::model::account::exchange_account::ExchangeAccountModel;
use order_audit::reconcile::report::{ReportItem, RunReport};
use order_audit::time_util;

/// 用交易所订单历史核对决策日志：补录缺失的平仓记录并纠正数值偏差
#[derive(Parser, Debug)]
#[command(name = "order_audit")]
struct Args {
    /// 包含 decision_*.json 的日志目录
    #[arg(long)]
    logs_dir: PathBuf,

    /// 逻辑交易员ID；缺省从目录名推断（形如 binance_<uuid>_..）
    #[arg(long)]
    trader: Option<String>,

    /// 交易所族，用于凭证回退链匹配
    #[arg(long, default_value = "binance")]
    exchange: String,

    /// 显式指定交易所账户ID，短路凭证回退链
    #[arg(long)]
    account: Option<String>,

    /// 逗号分隔的交易对列表；缺省取日志里出现过的交易对
    #[arg(long)]
    symbols: Option<String>,

    /// 只统计该时间(含)之后的决策，如 2025-11-09T00:00:00+08:00
    #[arg(long)]
    from_iso: Option<String>,

    /// 只统计该时间(含)之前的决策
    #[arg(long)]
    to_iso: Option<String>,

    /// 只报告、不落盘
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// 用进程内缓存替代MySQL（不跨进程保留游标）
    #[arg(long, default_value_t = false)]
    mem_cache: bool,
}

/// 日志目录名形如 binance_<uuid>_<model>_<ts>，第二段是交易员ID
fn trader_from_dir_name(logs_dir: &PathBuf) -> Option<String> {
    logs_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('_').nth(1))
        .map(|s| s.to_string())
}

/// 解析账户凭证：环境变量里有key时直接用（等价显式短路），否则走存储快照+回退链
async fn resolve_accounts(args: &Args) -> Result<Vec<ResolvedAccount>, AppError> {
    if let (Ok(api_key), Ok(secret_key)) = (
        env::var("BINANCE_API_KEY"),
        env::var("BINANCE_SECRET_KEY"),
    ) {
        let account_id = args
            .account
            .clone()
            .unwrap_or_else(|| "env_account".to_string());
        info!("使用环境变量凭证 account_id={}", account_id);
        return Ok(vec![ResolvedAccount {
            account_id,
            api_key,
            secret_key,
            base_url: env::var("BINANCE_BASE_URL").ok(),
        }]);
    }

    let trader_id = args
        .trader
        .clone()
        .or_else(|| trader_from_dir_name(&args.logs_dir))
        .ok_or_else(|| {
            AppError::NoCredentialsFound("无法确定交易员ID，请传 --trader".to_string())
        })?;
    let rows = ExchangeAccountModel::new()
        .fetch_all()
        .await
        .map_err(|e| AppError::DbError(e.to_string()))?;
    let snapshot = CredentialStoreSnapshot::new(rows);
    let request = ResolveRequest {
        trader_id,
        exchange_family: args.exchange.clone(),
        explicit_account: args.account.clone(),
    };
    credential::resolve(&request, &snapshot)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    setup_logging().await?;

    let args = Args::parse();
    if !args.logs_dir.is_dir() {
        return Err(anyhow!("日志目录不存在: {}", args.logs_dir.display()));
    }

    let mut config = ReconcileConfig::from_env();
    config.dry_run = args.dry_run;
    if let Some(s) = &args.from_iso {
        config.from_time =
            Some(time_util::parse_iso_to_utc(s).ok_or_else(|| anyhow!("无法解析 --from-iso: {}", s))?);
    }
    if let Some(s) = &args.to_iso {
        config.to_time =
            Some(time_util::parse_iso_to_utc(s).ok_or_else(|| anyhow!("无法解析 --to-iso: {}", s))?);
    }

    // 缓存存储不可用对整轮任务是致命的，其余失败都按单项聚合
    let cache: Arc<dyn ReconcileCache> = if args.mem_cache {
        memory_cache()
    } else {
        init_db().await?;
        let db_cache = DbReconcileCache::new();
        db_cache.ensure_tables().await?;
        Arc::new(db_cache)
    };

    let mut report = RunReport::new();

    // 凭证解析失败跳过摄取，仅用已有缓存跑匹配
    let accounts = match resolve_accounts(&args).await {
        Ok(accounts) => accounts,
        Err(e) => {
            error!("{}", e);
            report.record(ReportItem::CredentialFailure {
                trader_id: args.trader.clone().unwrap_or_default(),
                detail: e.to_string(),
            });
            Vec::new()
        }
    };

    // 交易对集合：显式传入，或取日志条目里出现过的
    let symbols: Vec<String> = match &args.symbols {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => {
            let outcome = decision::load_dir(&args.logs_dir)?;
            let set: BTreeSet<String> = outcome
                .entries
                .iter()
                .map(|e| e.record.symbol.clone())
                .collect();
            set.into_iter().collect()
        }
    };
    if symbols.is_empty() {
        warn!("没有可对账的交易对，目录: {}", args.logs_dir.display());
    }

    // 摄取：账户之间并发，各自持有限速计时；账户内交易对串行
    // 缓存按account_id分片，游标写入按key串行，账户并发没有写冲突
    let mut tasks = Vec::new();
    for account in &accounts {
        let ingestor =
            OrderIngestor::new(account, Arc::clone(&cache), config.min_request_interval_ms);
        let symbols = symbols.clone();
        tasks.push(tokio::spawn(async move {
            ingestor.sync_account(&symbols).await
        }));
    }
    for outcome in join_all(tasks).await {
        match outcome {
            Ok(outcome) => {
                report.orders_ingested += outcome.inserted;
                for item in outcome.items {
                    report.record(item);
                }
            }
            Err(e) => error!("摄取任务异常退出: {}", e),
        }
    }

    // 匹配：按回退链顺序逐账户查缓存
    let account_ids: Vec<String> = accounts.iter().map(|a| a.account_id.clone()).collect();
    let engine = MatchingEngine::new(Arc::clone(&cache), config);
    engine
        .reconcile_dir(&args.logs_dir, &account_ids, &mut report)
        .await?;

    report.write_reports(&args.logs_dir)?;
    Ok(())
}
