//! エンドポイント分類ごとのレート制限（トークンバケット）
//!
//! 判定の算術は orders-core の純粋関数に置いてあり、ここはその状態管理だけを持つ。
//! - ローカル実装: プロセス内 DashMap + バケット単位 Mutex。補充→消費→保存が
//!   ロック内で完結し、並行呼び出しは線形な履歴を観測する
//! - 共有実装: Redis 上の状態を Lua スクリプト1回で補充→消費→保存する。
//!   複数プロセスから同時に叩いても古いトークン数を読んだ二重許可は起きない
//!
//! 両実装は同じ `(bucket_key, now)` 列に対して同じ判定を返す。

use async_trait::async_trait;
use dashmap::DashMap;
use orders_core::{initial_state, refill_and_consume, BucketState, TokenBucketDecision};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::clock::now_millis;

/// バケット選択と判定の窓口。バックエンドは設定時に選択する。
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_consume(
        &self,
        bucket_key: &str,
        capacity: u32,
        refill_per_second: f64,
    ) -> TokenBucketDecision;
}

/// プロセス内トークンバケット
pub struct InMemoryTokenBucket {
    buckets: DashMap<String, Mutex<BucketState>>,
}

impl InMemoryTokenBucket {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// 時刻を注入できる判定本体。テストとトレイト実装の両方から使う。
    pub fn try_consume_at(
        &self,
        bucket_key: &str,
        capacity: u32,
        refill_per_second: f64,
        now_ms: u64,
    ) -> TokenBucketDecision {
        let bucket = self
            .buckets
            .entry(bucket_key.to_string())
            .or_insert_with(|| Mutex::new(initial_state(capacity, now_ms)));
        let mut state = bucket.lock();
        refill_and_consume(&mut state, now_ms, capacity, refill_per_second)
    }
}

impl Default for InMemoryTokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiter for InMemoryTokenBucket {
    async fn try_consume(
        &self,
        bucket_key: &str,
        capacity: u32,
        refill_per_second: f64,
    ) -> TokenBucketDecision {
        self.try_consume_at(bucket_key, capacity, refill_per_second, now_millis())
    }
}

/// 補充→消費→保存を1回の呼び出しで実行する Lua スクリプト。
/// orders-core::refill_and_consume と同じ算術を使う。
/// キー: `{key}` = トークン数, `{key}:ts` = 最終補充時刻（ms）
const TOKEN_BUCKET_SCRIPT: &str = r#"
local k = KEYS[1]
local kts = k .. ':ts'
local capacity = tonumber(ARGV[1])
local refill_per_sec = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local tokens = tonumber(redis.call('GET', k) or capacity)
local ts = tonumber(redis.call('GET', kts) or now_ms)
local elapsed = (now_ms - ts) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill_per_sec)
if tokens >= 1 then
  tokens = tokens - 1
  redis.call('SET', k, tostring(tokens))
  redis.call('SET', kts, tostring(now_ms))
  return {1, 0}
else
  local retry_after = math.ceil((1 - tokens) / refill_per_sec)
  if retry_after < 1 then retry_after = 1 end
  return {0, retry_after}
end
"#;

/// Redis 共有トークンバケット
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    script: redis::Script,
}

impl RedisTokenBucket {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisTokenBucket {
    async fn try_consume(
        &self,
        bucket_key: &str,
        capacity: u32,
        refill_per_second: f64,
    ) -> TokenBucketDecision {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<Vec<i64>> = self
            .script
            .key(bucket_key)
            .arg(capacity)
            .arg(refill_per_second)
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(reply) if reply.len() >= 2 => {
                if reply[0] == 1 {
                    TokenBucketDecision::Allowed
                } else {
                    TokenBucketDecision::Rejected {
                        retry_after_seconds: reply[1].max(1) as u64,
                    }
                }
            }
            Ok(reply) => {
                // 想定外の応答形。制限を諦めて通す（可用性優先）
                warn!(?reply, bucket_key, "unexpected token bucket reply, allowing");
                TokenBucketDecision::Allowed
            }
            Err(e) => {
                warn!(error = %e, bucket_key, "token bucket store unavailable, allowing");
                TokenBucketDecision::Allowed
            }
        }
    }
}
