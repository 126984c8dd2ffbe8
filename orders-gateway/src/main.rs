//! Orders Gateway - 注文管理サービス
//!
//! 並行・部分失敗下でも注文の作成/読み取りを安全にするための
//! 入口制御と整合性制御をまとめたサービス。
//!
//! ## コアフロー（超要約）
//! 1) POST /api/v1/orders は 同時実行枠 → トークンバケット → 冪等調停 を通る
//! 2) 冪等キーの claim 勝者だけが作成処理を実行し、結果を確定・再生可能にする
//! 3) GET /api/v1/orders/{id} はキャッシュアサイド + 移入リースで読む
//! 4) 書き込み後はキャッシュ無効化のみ（遅延再移入）
//!
//! ## 環境変数
//! - `GATEWAY_PORT`: HTTPサーバーのポート（デフォルト: 8080）
//! - `REDIS_URL`: 指定時はレート制限/冪等ストア/キャッシュを Redis 共有に切替
//! - `RUST_LOG`: ログレベル（デフォルト: info）

mod admission;
mod cache;
mod clock;
mod config;
mod error;
mod idempotency;
mod metrics;
mod order;
mod ratelimit;
mod repo;
mod server;
mod service;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cache::{CacheSettings, InMemoryOrderCache, NoopOrderCache, OrderCache, RedisOrderCache};
use config::CacheBackend;
use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore};
use metrics::{AtomicOrderMetrics, OrderMetrics};
use ratelimit::{InMemoryTokenBucket, RateLimiter, RedisTokenBucket};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) プロセス初期化（ログ + 設定）
    init_tracing();
    let config = config::Config::from_env();
    info!("Orders gateway starting with config: {:?}", config);

    // 2) Redis接続（URL指定時のみ）。レート制限・冪等ストア・キャッシュで共有する
    let redis_conn = match config.redis_url.as_deref() {
        Some(url) => {
            let client = redis::Client::open(url)?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            info!("Redis connection established");
            Some(conn)
        }
        None => None,
    };

    // 3) コア依存の初期化。バックエンドはここで一度だけ選択する
    let metrics = Arc::new(AtomicOrderMetrics::new());
    let metrics_dyn: Arc<dyn OrderMetrics> = Arc::clone(&metrics) as Arc<dyn OrderMetrics>;

    let limiter: Arc<dyn RateLimiter> = match redis_conn.clone() {
        Some(conn) => Arc::new(RedisTokenBucket::new(conn)),
        None => Arc::new(InMemoryTokenBucket::new()),
    };
    info!(
        "Rate limiter initialized (backend={})",
        if redis_conn.is_some() { "redis" } else { "memory" }
    );

    let store: Arc<dyn IdempotencyStore> = match redis_conn.clone() {
        Some(conn) => Arc::new(RedisIdempotencyStore::new(conn)),
        None => Arc::new(InMemoryIdempotencyStore::new()),
    };

    let cache_settings = CacheSettings::from_config(&config);
    let cache: Arc<dyn OrderCache> = match (config.cache_backend, redis_conn) {
        (CacheBackend::Redis, Some(conn)) => Arc::new(RedisOrderCache::new(conn, cache_settings)),
        (CacheBackend::Redis, None) => {
            warn!("CACHE_BACKEND=redis but REDIS_URL is not set; cache disabled");
            Arc::new(NoopOrderCache)
        }
        (CacheBackend::Memory, _) => Arc::new(InMemoryOrderCache::new(cache_settings)),
        (CacheBackend::None, _) => Arc::new(NoopOrderCache),
    };

    let repo = Arc::new(repo::OrderRepository::new());
    let service = Arc::new(service::OrdersService::new(repo, cache, store, metrics_dyn));
    let admission = admission::AdmissionSemaphore::new(config.max_concurrent_order_creates);
    info!(
        "Admission semaphore initialized (max_concurrent: {})",
        admission.max_permits()
    );

    // 4) サーバー起動
    let state = server::http::AppState::new(
        service,
        limiter,
        config.rate_limit.clone(),
        admission,
        metrics,
    );
    server::http::run(config.port, state).await
}

/// ログ出力基盤を初期化する。
/// `RUST_LOG` が無い場合は `info,orders_gateway=debug` を既定値に使う。
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orders_gateway=debug".into()),
        )
        .init();
}
