//! 設定管理
//!
//! 環境変数から設定を読み込む。
//!
//! - `GATEWAY_PORT` (デフォルト: 8080)
//! - `REDIS_URL` (未指定ならインメモリバックエンドで動作)
//! - `CACHE_BACKEND` = memory | redis | none
//! - `RATE_LIMIT_POST_ORDERS_CAPACITY` / `RATE_LIMIT_POST_ORDERS_REFILL_PER_SEC`
//! - `RATE_LIMIT_GET_ORDER_CAPACITY` / `RATE_LIMIT_GET_ORDER_REFILL_PER_SEC`
//! - `MAX_CONCURRENT_ORDER_CREATES`
//! - `CACHE_TTL_MIN_SEC` / `CACHE_TTL_MAX_SEC` / `CACHE_LOCK_TTL_MS` / `CACHE_LOCK_MISS_WAIT_MS`

use std::env;
use std::str::FromStr;

/// エンドポイント分類ごとのトークンバケット設定
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub post_orders_capacity: u32,
    pub post_orders_refill_per_second: f64,
    pub get_order_capacity: u32,
    pub get_order_refill_per_second: f64,
}

/// キャッシュバックエンドの選択
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
    None,
}

/// Gateway設定
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTPサーバーポート
    pub port: u16,
    pub rate_limit: RateLimitSettings,
    /// 注文作成の同時実行上限（セマフォのサイズ）
    pub max_concurrent_order_creates: usize,
    pub cache_ttl_min_sec: u64,
    pub cache_ttl_max_sec: u64,
    pub cache_lock_ttl_ms: u64,
    pub cache_lock_miss_wait_ms: u64,
    pub redis_url: Option<String>,
    pub cache_backend: CacheBackend,
}

impl Config {
    /// 環境変数から設定を読み込む
    pub fn from_env() -> Self {
        // .envファイルがあれば読み込む（無くてもエラーにしない）
        let _ = dotenvy::dotenv();

        let redis_url = env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        let cache_backend = match env::var("CACHE_BACKEND").ok().as_deref() {
            Some("redis") => CacheBackend::Redis,
            Some("memory") => CacheBackend::Memory,
            Some("none") => CacheBackend::None,
            // 未指定時は Redis があれば Redis、無ければプロセス内キャッシュ
            _ => {
                if redis_url.is_some() {
                    CacheBackend::Redis
                } else {
                    CacheBackend::Memory
                }
            }
        };

        Self {
            port: parse_env("GATEWAY_PORT").unwrap_or(8080),
            rate_limit: RateLimitSettings {
                post_orders_capacity: parse_env("RATE_LIMIT_POST_ORDERS_CAPACITY").unwrap_or(100),
                post_orders_refill_per_second: parse_env("RATE_LIMIT_POST_ORDERS_REFILL_PER_SEC")
                    .unwrap_or(20.0),
                get_order_capacity: parse_env("RATE_LIMIT_GET_ORDER_CAPACITY").unwrap_or(200),
                get_order_refill_per_second: parse_env("RATE_LIMIT_GET_ORDER_REFILL_PER_SEC")
                    .unwrap_or(50.0),
            },
            max_concurrent_order_creates: parse_env("MAX_CONCURRENT_ORDER_CREATES").unwrap_or(50),
            cache_ttl_min_sec: parse_env("CACHE_TTL_MIN_SEC").unwrap_or(300),
            cache_ttl_max_sec: parse_env("CACHE_TTL_MAX_SEC").unwrap_or(900),
            cache_lock_ttl_ms: parse_env("CACHE_LOCK_TTL_MS").unwrap_or(5_000),
            cache_lock_miss_wait_ms: parse_env("CACHE_LOCK_MISS_WAIT_MS").unwrap_or(200),
            redis_url,
            cache_backend,
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
