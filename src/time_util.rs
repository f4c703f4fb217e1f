use chrono::{DateTime, FixedOffset, TimeZone, Utc};

pub fn mill_time_to_datetime(timestamp_ms: i64) -> Result<String, String> {
    // 将毫秒级时间戳转换为 DateTime<Utc>
    match Utc.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(datetime) => {
            let formatted_datetime = datetime.format("%Y-%m-%d %H:%M:%S").to_string();
            Ok(formatted_datetime)
        }
        chrono::LocalResult::None => Err("Invalid timestamp: None".to_string()),
        chrono::LocalResult::Ambiguous(_, _) => Err("Invalid timestamp: Ambiguous".to_string()),
    }
}

pub fn mill_time_to_datetime_shanghai(timestamp_ms: i64) -> Result<String, String> {
    match Utc.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(datetime) => {
            // 交易所时间戳是UTC时间，展示时转换为东八区
            let offset = FixedOffset::east_opt(8 * 3600).ok_or("invalid offset")?;
            let local_datetime = datetime.with_timezone(&offset);
            Ok(local_datetime.format("%Y-%m-%d %H:%M:%S").to_string())
        }
        chrono::LocalResult::None => Err("Invalid timestamp: None".to_string()),
        chrono::LocalResult::Ambiguous(_, _) => Err("Invalid timestamp: Ambiguous".to_string()),
    }
}

/// 把任意精度的epoch值归一化为毫秒
/// 兼容 秒(10位)/毫秒(13位)/微秒(16位)/纳秒(19位)，向下取整
pub fn epoch_to_millis(epoch_value: i64) -> i64 {
    let digits = epoch_value.abs().to_string().len();
    if digits >= 19 {
        // 纳秒
        epoch_value / 1_000_000
    } else if digits >= 16 {
        // 微秒
        epoch_value / 1_000
    } else if digits >= 13 {
        // 毫秒
        epoch_value
    } else {
        // 按秒处理
        epoch_value * 1_000
    }
}

/// 解析 ISO8601/RFC3339 时间串（兼容结尾Z），返回UTC时间
pub fn parse_iso_to_utc(s: &str) -> Option<DateTime<Utc>> {
    let normalized = if s.ends_with('Z') {
        s.replacen('Z', "+00:00", 1)
    } else {
        s.to_string()
    };
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 毫秒时间戳转DateTime<Utc>，非法值返回None
pub fn millis_to_utc(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    match Utc.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(dt) => Some(dt),
        _ => None,
    }
}

/// 宽松解析时间串：先按ISO8601解析，失败则按任意精度epoch数值处理
/// 上游程序的日志里两种写法都出现过
pub fn parse_flexible_ts(s: &str) -> Option<DateTime<Utc>> {
    if let Some(dt) = parse_iso_to_utc(s) {
        return Some(dt);
    }
    s.trim()
        .parse::<i64>()
        .ok()
        .and_then(|v| millis_to_utc(epoch_to_millis(v)))
}
