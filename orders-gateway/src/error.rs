//! エラー分類とHTTPステータスへの対応付け
//!
//! 入口層（server/http）から返すエラーはすべてここに集約する。
//! - 入口制御系（Overloaded / RateLimited）は呼び出し側へ即時返却、内部では再試行しない
//! - 冪等性系（Conflict / StillProcessing）は 409 で区別可能なメッセージを返す
//! - キャッシュ/リース障害はここまで到達させない（読み取り経路で握り潰して DB 直読へ劣化）

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

/// バリデーション失敗1件分
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// リクエスト処理の失敗分類
#[derive(Debug, Clone)]
pub enum ApiError {
    /// リクエスト形式不正。状態を一切変更する前に拒否する
    Validation(Vec<FieldError>),
    /// Idempotency-Key ヘッダー未指定
    MissingIdempotencyKey,
    /// 同じキーが異なる内容で再利用された（クライアント側バグのシグナル）
    IdempotencyConflict(String),
    /// 同じキーの先行リクエストが処理中（少し待って再試行可能）
    IdempotencyStillProcessing,
    /// 同時実行枠の飽和（バックプレッシャ）
    Overloaded(String),
    /// レート制限超過
    RateLimited { retry_after_seconds: u64 },
    /// 想定外の内部エラー
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(_) => write!(f, "Validation failed"),
            Self::MissingIdempotencyKey => write!(f, "Idempotency-Key header is required"),
            Self::IdempotencyConflict(msg) => write!(f, "{}", msg),
            Self::IdempotencyStillProcessing => write!(
                f,
                "Request with this idempotency key is still processing, retry later."
            ),
            Self::Overloaded(msg) => write!(f, "{}", msg),
            Self::RateLimited { .. } => write!(f, "Too Many Requests"),
            Self::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct ValidationErrorBody {
    message: String,
    errors: Vec<FieldError>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                Json(ValidationErrorBody {
                    message: "Validation failed".into(),
                    errors,
                }),
            )
                .into_response(),
            Self::MissingIdempotencyKey => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: self.to_string(),
                }),
            )
                .into_response(),
            Self::IdempotencyConflict(ref msg) => {
                warn!("Idempotency conflict: {}", msg);
                (
                    StatusCode::CONFLICT,
                    Json(ErrorBody {
                        error: self.to_string(),
                    }),
                )
                    .into_response()
            }
            Self::IdempotencyStillProcessing => {
                warn!("Idempotency key still processing");
                (
                    StatusCode::CONFLICT,
                    Json(ErrorBody {
                        error: self.to_string(),
                    }),
                )
                    .into_response()
            }
            Self::Overloaded(ref msg) => {
                warn!("Service overloaded (backpressure): {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody {
                        error: self.to_string(),
                    }),
                )
                    .into_response()
            }
            Self::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                Json(RateLimitedBody {
                    error: "Too Many Requests".into(),
                    retry_after_seconds,
                }),
            )
                .into_response(),
            Self::Internal(ref msg) => {
                error!("Unhandled error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: self.to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitedBody {
    error: String,
    retry_after_seconds: u64,
}
