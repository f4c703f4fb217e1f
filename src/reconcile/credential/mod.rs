use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::reconcile::model::account::exchange_account::ExchangeAccountEntity;

/// 账户选择请求
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// 逻辑交易员/用户ID
    pub trader_id: String,
    /// 交易所族，如 binance
    pub exchange_family: String,
    /// 调用方显式指定的账户ID，命中则短路整条回退链
    pub explicit_account: Option<String>,
}

/// 解析结果：可直接构造客户端的账户凭证
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub api_key: String,
    pub secret_key: String,
    pub base_url: Option<String>,
}

impl ResolvedAccount {
    fn from_record(record: &ExchangeAccountEntity) -> Self {
        Self {
            account_id: record.account_id.clone(),
            api_key: record.api_key.clone(),
            secret_key: record.secret_key.clone(),
            base_url: record.endpoint.clone(),
        }
    }
}

/// 凭证存储快照，一轮运行开始时加载一次，只读
#[derive(Debug, Clone, Default)]
pub struct CredentialStoreSnapshot {
    pub accounts: Vec<ExchangeAccountEntity>,
}

impl CredentialStoreSnapshot {
    pub fn new(accounts: Vec<ExchangeAccountEntity>) -> Self {
        Self { accounts }
    }
}

fn family_matches(record: &ExchangeAccountEntity, family: &str) -> bool {
    let family = family.to_lowercase();
    record.exchange_type.to_lowercase().contains(&family)
        || record.name.to_lowercase().contains(&family)
        || record.account_id.to_lowercase().contains(&family)
}

/// 回退链第1步：交易员名下、交易所类型精确匹配的绑定
fn exact_binding(req: &ResolveRequest, snap: &CredentialStoreSnapshot) -> Vec<ResolvedAccount> {
    snap.accounts
        .iter()
        .filter(|r| {
            r.user_id == req.trader_id
                && r.exchange_type.eq_ignore_ascii_case(&req.exchange_family)
        })
        .map(ResolvedAccount::from_record)
        .collect()
}

/// 回退链第2步：交易员名下，按 ID/名称/类型 做大小写不敏感的子串匹配
fn exchange_table_match(
    req: &ResolveRequest,
    snap: &CredentialStoreSnapshot,
) -> Vec<ResolvedAccount> {
    snap.accounts
        .iter()
        .filter(|r| r.user_id == req.trader_id && family_matches(r, &req.exchange_family))
        .map(ResolvedAccount::from_record)
        .collect()
}

/// 回退链第3步：跨用户搜索，返回所有命中的账户，逐个依次使用
fn cross_user_search(
    req: &ResolveRequest,
    snap: &CredentialStoreSnapshot,
) -> Vec<ResolvedAccount> {
    snap.accounts
        .iter()
        .filter(|r| family_matches(r, &req.exchange_family))
        .map(ResolvedAccount::from_record)
        .collect()
}

type ResolveStrategy = fn(&ResolveRequest, &CredentialStoreSnapshot) -> Vec<ResolvedAccount>;

/// 按回退链顺序解析账户凭证，返回第一个非空步骤的全部结果
/// 显式指定账户时短路，跳过第2/3步
pub fn resolve(
    req: &ResolveRequest,
    snap: &CredentialStoreSnapshot,
) -> Result<Vec<ResolvedAccount>, AppError> {
    if let Some(explicit) = &req.explicit_account {
        let found = snap
            .accounts
            .iter()
            .find(|r| &r.account_id == explicit)
            .map(ResolvedAccount::from_record);
        return match found {
            Some(account) => {
                debug!("凭证解析短路到显式账户: {}", explicit);
                Ok(vec![account])
            }
            None => Err(AppError::NoCredentialsFound(format!(
                "显式指定的账户不存在: {}",
                explicit
            ))),
        };
    }

    let chain: &[(&str, ResolveStrategy)] = &[
        ("exact_binding", exact_binding),
        ("exchange_table_match", exchange_table_match),
        ("cross_user_search", cross_user_search),
    ];
    for (step, strategy) in chain {
        let candidates = strategy(req, snap);
        if !candidates.is_empty() {
            debug!(
                "凭证解析命中步骤 {}: trader={} 账户数={}",
                step,
                req.trader_id,
                candidates.len()
            );
            return Ok(candidates);
        }
    }
    warn!(
        "凭证解析失败: trader={} exchange={}",
        req.trader_id, req.exchange_family
    );
    Err(AppError::NoCredentialsFound(format!(
        "trader={} exchange={} 在回退链任何一步都没有可用账户",
        req.trader_id, req.exchange_family
    )))
}
