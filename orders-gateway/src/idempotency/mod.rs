//! 冪等性レコードストア
//!
//! キー1つにつきレコード1件。本質的なプリミティブは条件付き INSERT で、
//! 「無ければ IN_PROGRESS で挿入 / あれば既存レコードを返す」をデータで
//! 判定して返す（例外による制御フローは使わない）。アトミック性は
//! ストレージ層（DashMap の entry / Redis の SET NX）に委ねる。
//!
//! レコードの status は IN_PROGRESS → COMPLETED の一方向にしか進まない。
//! この層はレコードを削除しない（保持期間の管理は外部方針）。

pub mod coordinator;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::now_millis;

const REDIS_KEY_PREFIX: &str = "idem:";

/// レコードの進行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
}

/// キー1件分の記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// 挿入後は不変。同キー再利用の検出に使う
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub order_id: Option<Uuid>,
    pub response_code: Option<u16>,
    /// 再生時にそのまま返すボディ
    pub response_body: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl IdempotencyRecord {
    fn in_progress(key: &str, request_hash: &str, now: u64) -> Self {
        Self {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::InProgress,
            order_id: None,
            response_code: None,
            response_body: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 条件付き INSERT の結果
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists(IdempotencyRecord),
}

/// ストア操作の失敗
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "idempotency store error: {}", self.0)
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// キーが未登録なら IN_PROGRESS で挿入する。並行呼び出しに対して
    /// アトミックで、勝者1人だけが Inserted を受け取る。
    async fn try_insert_in_progress(
        &self,
        key: &str,
        request_hash: &str,
    ) -> Result<InsertOutcome, StoreError>;

    /// COMPLETED へ確定する。呼び出し元が claim の勝者であることが前提で、
    /// 並行に競合しない。status を後退させることはない。
    async fn mark_completed(
        &self,
        key: &str,
        order_id: Option<Uuid>,
        response_code: u16,
        response_body: &str,
    ) -> Result<(), StoreError>;

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;
}

/// プロセス内ストア。DashMap の entry がシャード単位の排他で
/// check-and-insert をアトミックにする。
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_insert_in_progress(
        &self,
        key: &str,
        request_hash: &str,
    ) -> Result<InsertOutcome, StoreError> {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(existing) => Ok(InsertOutcome::AlreadyExists(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(IdempotencyRecord::in_progress(
                    key,
                    request_hash,
                    now_millis(),
                ));
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn mark_completed(
        &self,
        key: &str,
        order_id: Option<Uuid>,
        response_code: u16,
        response_body: &str,
    ) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError(format!("no record for key {}", key)))?;
        if record.status == IdempotencyStatus::Completed {
            // 終端状態は上書きしない
            return Ok(());
        }
        record.status = IdempotencyStatus::Completed;
        record.order_id = order_id;
        record.response_code = Some(response_code);
        record.response_body = Some(response_body.to_string());
        record.updated_at = now_millis();
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }
}

/// Redis 共有ストア。claim は SET NX（挿入成功＝勝者）で決まる。
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
}

impl RedisIdempotencyStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn redis_key(key: &str) -> String {
        format!("{}{}", REDIS_KEY_PREFIX, key)
    }

    async fn fetch(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError(format!("corrupt record for key {}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(|e| StoreError(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::redis_key(&record.key))
            .arg(json)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn try_insert_in_progress(
        &self,
        key: &str,
        request_hash: &str,
    ) -> Result<InsertOutcome, StoreError> {
        let record = IdempotencyRecord::in_progress(key, request_hash, now_millis());
        let json = serde_json::to_string(&record).map_err(|e| StoreError(e.to_string()))?;

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::redis_key(key))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError(e.to_string()))?;

        if reply.is_some() {
            return Ok(InsertOutcome::Inserted);
        }
        match self.fetch(key).await? {
            Some(existing) => Ok(InsertOutcome::AlreadyExists(existing)),
            // NX で負けた直後に消えているのは運用操作以外ではありえない
            None => Err(StoreError(format!(
                "record for key {} vanished after failed insert",
                key
            ))),
        }
    }

    async fn mark_completed(
        &self,
        key: &str,
        order_id: Option<Uuid>,
        response_code: u16,
        response_body: &str,
    ) -> Result<(), StoreError> {
        let mut record = self
            .fetch(key)
            .await?
            .ok_or_else(|| StoreError(format!("no record for key {}", key)))?;
        if record.status == IdempotencyStatus::Completed {
            return Ok(());
        }
        record.status = IdempotencyStatus::Completed;
        record.order_id = order_id;
        record.response_code = Some(response_code);
        record.response_body = Some(response_body.to_string());
        record.updated_at = now_millis();
        self.put(&record).await
    }

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.fetch(key).await
    }
}
