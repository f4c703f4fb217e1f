use thiserror::Error;

/// 应用错误
/// 单项失败（凭证/网络/解析/写文件）都不会中断整轮对账，
/// 只有存储层不可用才会让整轮任务失败
#[derive(Error, Debug)]
pub enum AppError {
    /// 凭证解析失败：回退链每一步都没有找到可用账户
    #[error("凭证解析失败: {0}")]
    NoCredentialsFound(String),

    /// 网络错误：交易所API超时、瞬时错误或响应格式异常
    #[error("网络请求失败: {0}")]
    NetworkError(String),

    /// 决策日志文件无法解析为合法记录
    #[error("日志解析失败: {0}")]
    ParseError(String),

    /// 备份或改写日志文件失败，条目保持改写前状态
    #[error("文件写入失败: {0}")]
    WriteError(String),

    /// 数据库错误（缓存存储不可用时对整轮任务是致命的）
    #[error("数据库错误: {0}")]
    DbError(String),
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::NetworkError(err.to_string())
    }
}

impl From<rbatis::Error> for AppError {
    fn from(err: rbatis::Error) -> Self {
        AppError::DbError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ParseError(err.to_string())
    }
}
