//! 冪等な注文作成の調停
//!
//! claim → 実行 → 確定 → 再生 の状態機械。1つのキーに対して
//! 作成処理は高々1回しか実行されない。
//!
//! - claim 勝者: 作成処理を実行し、成功なら (201, ボディ) を、失敗なら
//!   (500, エラーボディ) を COMPLETED として確定する。失敗も確定するのは、
//!   同じキーの再試行に「再実行」ではなく「同じ失敗の再生」を返すため
//! - claim 敗者: 既存レコードの request_hash が違えば Conflict、
//!   COMPLETED なら保存済み応答をそのまま再生、IN_PROGRESS なら
//!   StillProcessing（勝者が確定する前の競合窓）

use std::future::Future;
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::ApiError;
use crate::metrics::OrderMetrics;
use crate::order::{CreateOrderRequest, CreateOrderResponse};

use super::{IdempotencyStatus, IdempotencyStore, InsertOutcome};

/// 調停結果。Created はこの呼び出しで実行されたことを、
/// Replay は保存済み応答をそのまま返すことを表す。
#[derive(Debug)]
pub enum IdempotentCreateOutcome {
    Created {
        response: CreateOrderResponse,
        /// 確定時に保存したボディ。再生時と byte 単位で一致する
        body: String,
    },
    Replay {
        response_code: u16,
        body: String,
    },
}

pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    metrics: Arc<dyn OrderMetrics>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn IdempotencyStore>, metrics: Arc<dyn OrderMetrics>) -> Self {
        Self { store, metrics }
    }

    /// 冪等キー付きで注文作成を1回だけ実行する。
    pub async fn create_order_idempotent<F, Fut>(
        &self,
        key: &str,
        request: &CreateOrderRequest,
        execute: F,
    ) -> Result<IdempotentCreateOutcome, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CreateOrderResponse, ApiError>>,
    {
        let request_hash = request.canonical_hash();

        let outcome = self
            .store
            .try_insert_in_progress(key, &request_hash)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let existing = match outcome {
            InsertOutcome::Inserted => {
                return self.execute_claimed(key, execute).await;
            }
            InsertOutcome::AlreadyExists(existing) => existing,
        };

        if existing.request_hash != request_hash {
            self.metrics.record_idempotency_conflict();
            return Err(ApiError::IdempotencyConflict(
                "Idempotency key was used for a different request".into(),
            ));
        }

        match existing.status {
            IdempotencyStatus::Completed => {
                self.metrics.record_idempotency_hit();
                Ok(IdempotentCreateOutcome::Replay {
                    response_code: existing.response_code.unwrap_or(200),
                    body: existing.response_body.unwrap_or_else(|| "{}".to_string()),
                })
            }
            IdempotencyStatus::InProgress => Err(ApiError::IdempotencyStillProcessing),
        }
    }

    /// claim 勝者の経路。実行結果を必ず COMPLETED へ確定してから返す。
    async fn execute_claimed<F, Fut>(
        &self,
        key: &str,
        execute: F,
    ) -> Result<IdempotentCreateOutcome, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CreateOrderResponse, ApiError>>,
    {
        match execute().await {
            Ok(response) => {
                let body = serde_json::to_string(&response)
                    .map_err(|e| ApiError::Internal(format!("failed to serialize response: {}", e)))?;
                if let Err(e) = self
                    .store
                    .mark_completed(key, Some(response.order_id), 201, &body)
                    .await
                {
                    // 注文自体は永続済みなので応答は返す。レコードは IN_PROGRESS の
                    // まま残り、以後の再試行は StillProcessing を受け取る
                    error!(error = %e, key, "failed to finalize idempotency record");
                }
                Ok(IdempotentCreateOutcome::Created { response, body })
            }
            Err(err) => {
                // 失敗も終端として確定し、同じキーの再試行には同じ失敗を再生する
                let error_body = serde_json::json!({ "error": err.to_string() }).to_string();
                if let Err(e) = self.store.mark_completed(key, None, 500, &error_body).await {
                    warn!(error = %e, key, "failed to record failed outcome");
                }
                Err(err)
            }
        }
    }
}
