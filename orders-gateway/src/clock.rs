//! 時刻ヘルパー

use std::time::{SystemTime, UNIX_EPOCH};

/// 現在時刻を epoch ミリ秒で返す。
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
