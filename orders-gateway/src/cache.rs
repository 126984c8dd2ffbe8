//! 注文読み取りのキャッシュアサイド
//!
//! キー: `order:{orderId}`、移入リース: `lock:order:{orderId}`。
//! TTL は `[min,max]` 秒から一様乱数で引く（一斉失効を避けるジッタ）。
//!
//! スタンピード抑止:
//! - ミス時は短TTLの排他リースを set-if-absent で取りに行く
//! - 取れた側だけが真実の源から読んでキャッシュを移入し、成否に関わらず解放する
//! - 取れなかった側は固定の短い待機1回 → キャッシュ再確認1回 → それでも無ければ
//!   キャッシュを移入せずに真実の源へ直接フォールバックする
//!
//! キャッシュ/リースストアの障害はすべてミス扱いに握り潰す。キャッシュが
//! 落ちていても読み取りの正しさは変わらず、速さだけが失われる。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::OrderMetrics;
use crate::order::OrderView;

const CACHE_KEY_PREFIX: &str = "order:";
const LOCK_KEY_PREFIX: &str = "lock:order:";

/// キャッシュ挙動の設定値
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl_min_sec: u64,
    pub ttl_max_sec: u64,
    pub lock_ttl_ms: u64,
    pub lock_miss_wait_ms: u64,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ttl_min_sec: config.cache_ttl_min_sec,
            ttl_max_sec: config.cache_ttl_max_sec,
            lock_ttl_ms: config.cache_lock_ttl_ms,
            lock_miss_wait_ms: config.cache_lock_miss_wait_ms,
        }
    }

    fn ttl_with_jitter(&self) -> u64 {
        if self.ttl_max_sec > self.ttl_min_sec {
            rand::thread_rng().gen_range(self.ttl_min_sec..=self.ttl_max_sec)
        } else {
            self.ttl_min_sec
        }
    }
}

/// 注文ビューのキャッシュ窓口。障害は実装内で握り潰し、呼び出し側には
/// 「ミス」「リース取得失敗」として見せる。
#[async_trait]
pub trait OrderCache: Send + Sync {
    /// false なら読み取り経路はキャッシュを一切経由しない
    fn enabled(&self) -> bool {
        true
    }
    async fn get(&self, order_id: Uuid) -> Option<OrderView>;
    async fn set(&self, order_id: Uuid, view: &OrderView);
    async fn invalidate(&self, order_id: Uuid);
    /// 移入リースの取得。true を返した呼び出し元は必ず release_lock する
    async fn try_lock(&self, order_id: Uuid) -> bool;
    async fn release_lock(&self, order_id: Uuid);
    fn wait_after_lock_miss(&self) -> Duration;
}

/// キャッシュ無効化構成。読み取りは常に真実の源へ向かう。
pub struct NoopOrderCache;

#[async_trait]
impl OrderCache for NoopOrderCache {
    fn enabled(&self) -> bool {
        false
    }

    async fn get(&self, _order_id: Uuid) -> Option<OrderView> {
        None
    }

    async fn set(&self, _order_id: Uuid, _view: &OrderView) {}

    async fn invalidate(&self, _order_id: Uuid) {}

    async fn try_lock(&self, _order_id: Uuid) -> bool {
        false
    }

    async fn release_lock(&self, _order_id: Uuid) {}

    fn wait_after_lock_miss(&self) -> Duration {
        Duration::ZERO
    }
}

/// プロセス内キャッシュ。単一プロセス構成とテストで使う。
/// 期限切れは読み出し時に遅延削除する。
pub struct InMemoryOrderCache {
    entries: DashMap<Uuid, (OrderView, Instant)>,
    leases: DashMap<Uuid, Instant>,
    settings: CacheSettings,
}

impl InMemoryOrderCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            leases: DashMap::new(),
            settings,
        }
    }
}

#[async_trait]
impl OrderCache for InMemoryOrderCache {
    async fn get(&self, order_id: Uuid) -> Option<OrderView> {
        match self.entries.get(&order_id) {
            Some(entry) => {
                let (view, expires_at) = entry.value();
                if *expires_at > Instant::now() {
                    return Some(view.clone());
                }
                drop(entry);
                self.entries.remove(&order_id);
                None
            }
            None => None,
        }
    }

    async fn set(&self, order_id: Uuid, view: &OrderView) {
        let ttl = Duration::from_secs(self.settings.ttl_with_jitter());
        self.entries
            .insert(order_id, (view.clone(), Instant::now() + ttl));
    }

    async fn invalidate(&self, order_id: Uuid) {
        self.entries.remove(&order_id);
    }

    async fn try_lock(&self, order_id: Uuid) -> bool {
        let now = Instant::now();
        let expires_at = now + Duration::from_millis(self.settings.lock_ttl_ms);
        match self.leases.entry(order_id) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    return false;
                }
                // 失効したリースは奪ってよい（保持者がクラッシュしても前進できる）
                held.insert(expires_at);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        }
    }

    async fn release_lock(&self, order_id: Uuid) {
        self.leases.remove(&order_id);
    }

    fn wait_after_lock_miss(&self) -> Duration {
        Duration::from_millis(self.settings.lock_miss_wait_ms)
    }
}

/// Redis キャッシュ。複数インスタンス構成での共有リース付き。
pub struct RedisOrderCache {
    conn: ConnectionManager,
    settings: CacheSettings,
}

impl RedisOrderCache {
    pub fn new(conn: ConnectionManager, settings: CacheSettings) -> Self {
        Self { conn, settings }
    }

    fn cache_key(order_id: Uuid) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, order_id)
    }

    fn lock_key(order_id: Uuid) -> String {
        format!("{}{}", LOCK_KEY_PREFIX, order_id)
    }
}

#[async_trait]
impl OrderCache for RedisOrderCache {
    async fn get(&self, order_id: Uuid) -> Option<OrderView> {
        let mut conn = self.conn.clone();
        let raw: redis::RedisResult<Option<String>> = redis::cmd("GET")
            .arg(Self::cache_key(order_id))
            .query_async(&mut conn)
            .await;
        match raw {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(view) => Some(view),
                Err(e) => {
                    warn!(error = %e, %order_id, "failed to parse cached order, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, %order_id, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, order_id: Uuid, view: &OrderView) {
        let json = match serde_json::to_string(view) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, %order_id, "failed to serialize order for cache");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(Self::cache_key(order_id))
            .arg(json)
            .arg("EX")
            .arg(self.settings.ttl_with_jitter())
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, %order_id, "cache write failed");
        }
    }

    async fn invalidate(&self, order_id: Uuid) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("DEL")
            .arg(Self::cache_key(order_id))
            .query_async(&mut conn)
            .await;
        match result {
            Ok(removed) if removed > 0 => debug!(%order_id, "cache invalidated"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, %order_id, "cache invalidation failed"),
        }
    }

    async fn try_lock(&self, order_id: Uuid) -> bool {
        let mut conn = self.conn.clone();
        // SET NX PX: 取得と同時に失効を仕込む。保持者が消えても自動解放される
        let reply: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(Self::lock_key(order_id))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(self.settings.lock_ttl_ms)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, %order_id, "lease store unavailable");
                false
            }
        }
    }

    async fn release_lock(&self, order_id: Uuid) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("DEL")
            .arg(Self::lock_key(order_id))
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, %order_id, "lease release failed");
        }
    }

    fn wait_after_lock_miss(&self) -> Duration {
        Duration::from_millis(self.settings.lock_miss_wait_ms)
    }
}

/// キャッシュアサイド読み取り本体。
/// `load` は真実の源からの読み出しで、移入はリース保持者だけが行う。
pub async fn read_through<F>(
    cache: &dyn OrderCache,
    metrics: &dyn OrderMetrics,
    order_id: Uuid,
    load: F,
) -> Result<Option<OrderView>, ApiError>
where
    F: Fn() -> Result<Option<OrderView>, ApiError>,
{
    if !cache.enabled() {
        return load();
    }

    if let Some(view) = cache.get(order_id).await {
        metrics.record_cache_hit();
        debug!(%order_id, "cache hit");
        return Ok(Some(view));
    }
    metrics.record_cache_miss();
    debug!(%order_id, "cache miss");

    if cache.try_lock(order_id).await {
        let outcome = populate(cache, order_id, &load).await;
        // 読み出しの成否に関わらず必ず解放する
        cache.release_lock(order_id).await;
        return outcome;
    }

    // リースは他の移入者が保持中。固定の短い待機1回 → 再確認1回
    tokio::time::sleep(cache.wait_after_lock_miss()).await;
    if let Some(view) = cache.get(order_id).await {
        return Ok(Some(view));
    }
    // 移入せず直接フォールバック。リース窓あたりの源読み出しを抑えたまま
    // 競合敗者の待ちを有限に保つ
    load()
}

async fn populate<F>(
    cache: &dyn OrderCache,
    order_id: Uuid,
    load: &F,
) -> Result<Option<OrderView>, ApiError>
where
    F: Fn() -> Result<Option<OrderView>, ApiError>,
{
    // リース取得までの間に他の保持者が移入済みかもしれない
    if let Some(view) = cache.get(order_id).await {
        return Ok(Some(view));
    }
    let loaded = load()?;
    if let Some(ref view) = loaded {
        cache.set(order_id, view).await;
    }
    Ok(loaded)
}
