//! トークンバケット演算
//!
//! ## 目的
//! レート制限の判定ロジックを純粋関数として一箇所に置く。
//! - ローカル実装（プロセス内 Mutex 保護）はこの関数をそのまま呼ぶ
//! - 共有実装（Redis Lua スクリプト）は同じ算術をスクリプト内で再現する
//!
//! 同一の `(bucket_key, now)` 列に対して両実装が同じ判定を返すことが
//! 適合条件。テストは時刻を注入して検証する。

/// バケット1個分の状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// 残トークン。常に `[0, capacity]` の範囲
    pub tokens: f64,
    /// 最終補充時刻（epoch ミリ秒）
    pub last_refill_ms: u64,
}

/// 消費判定の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenBucketDecision {
    Allowed,
    Rejected {
        /// クライアントが再試行してよいまでの秒数（1以上）
        retry_after_seconds: u64,
    },
}

impl TokenBucketDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// 初回利用時のバケット状態。満タンで開始する。
pub fn initial_state(capacity: u32, now_ms: u64) -> BucketState {
    BucketState {
        tokens: capacity as f64,
        last_refill_ms: now_ms,
    }
}

/// 補充してから1トークン消費を試みる。
///
/// 経過時間ぶんを `refill_per_second` のレートで補充（上限 capacity）、
/// 1トークン以上あれば消費して許可。足りなければ拒否し、1トークン貯まる
/// までの秒数を切り上げて返す（最低1秒）。
pub fn refill_and_consume(
    state: &mut BucketState,
    now_ms: u64,
    capacity: u32,
    refill_per_second: f64,
) -> TokenBucketDecision {
    let elapsed_sec = now_ms.saturating_sub(state.last_refill_ms) as f64 / 1000.0;
    state.tokens = (state.tokens + elapsed_sec * refill_per_second).min(capacity as f64);
    state.last_refill_ms = now_ms;

    if state.tokens >= 1.0 {
        state.tokens -= 1.0;
        return TokenBucketDecision::Allowed;
    }

    // refill_per_second が 0 以下なら永遠に貯まらない。f64 の inf は
    // as キャストで u64::MAX に飽和するのでそのまま扱える。
    let retry_after = ((1.0 - state.tokens) / refill_per_second).ceil() as u64;
    TokenBucketDecision::Rejected {
        retry_after_seconds: retry_after.max(1),
    }
}
