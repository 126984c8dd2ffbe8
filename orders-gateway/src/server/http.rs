//! HTTP サーバー
//!
//! ## エンドポイント
//! - POST /api/v1/orders: 冪等キー付き注文作成
//! - GET /api/v1/orders/{orderId}: ID指定取得（キャッシュアサイド）
//! - GET /api/v1/orders: 一覧（ページング）
//! - GET /health: ヘルスチェック
//! - GET /metrics: メトリクス（Prometheus形式）
//!
//! 作成の入口は 同時実行枠（503） → トークンバケット（429） → 冪等調停 の順。

use std::sync::Arc;

use crate::metrics::OrderMetrics;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use orders_core::TokenBucketDecision;

use crate::admission::AdmissionSemaphore;
use crate::config::RateLimitSettings;
use crate::error::ApiError;
use crate::idempotency::coordinator::IdempotentCreateOutcome;
use crate::metrics::AtomicOrderMetrics;
use crate::order::{CreateOrderRequest, OrderStatus, OrderView, PageResponse};
use crate::ratelimit::RateLimiter;
use crate::repo::SortProperty;
use crate::service::OrdersService;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// エンドポイント分類ごとのバケットキー
const POST_ORDERS_BUCKET: &str = "ratelimit:post:orders";
const GET_ORDER_BUCKET: &str = "ratelimit:get:order";

const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_PAGE_SIZE: u32 = 20;

/// アプリケーション状態
#[derive(Clone)]
pub struct AppState {
    service: Arc<OrdersService>,
    limiter: Arc<dyn RateLimiter>,
    rate_settings: RateLimitSettings,
    admission: AdmissionSemaphore,
    metrics: Arc<AtomicOrderMetrics>,
}

impl AppState {
    pub fn new(
        service: Arc<OrdersService>,
        limiter: Arc<dyn RateLimiter>,
        rate_settings: RateLimitSettings,
        admission: AdmissionSemaphore,
        metrics: Arc<AtomicOrderMetrics>,
    ) -> Self {
        Self {
            service,
            limiter,
            rate_settings,
            admission,
            metrics,
        }
    }
}

/// HTTPサーバーを起動
pub async fn run(port: u16, state: AppState) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/orders",
            post(handle_create_order).get(handle_list_orders),
        )
        .route("/api/v1/orders/:order_id", get(handle_get_order))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 注文作成ハンドラ
///
/// POST /api/v1/orders
async fn handle_create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Response, ApiError> {
    // 冪等キーは契約上必須。空白のみも未指定扱いで即時拒否する
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::MissingIdempotencyKey)?;

    // 状態を変更する前にバリデーション
    req.validate().map_err(ApiError::Validation)?;

    // 同時実行枠。枠が無ければ待たずに 503。permit は Drop で返却される
    let _permit = state.admission.try_acquire().ok_or_else(|| {
        state.metrics.record_overloaded();
        ApiError::Overloaded("Too many concurrent order creations".into())
    })?;

    // エンドポイント分類単位のレート制限
    if let TokenBucketDecision::Rejected {
        retry_after_seconds,
    } = state
        .limiter
        .try_consume(
            POST_ORDERS_BUCKET,
            state.rate_settings.post_orders_capacity,
            state.rate_settings.post_orders_refill_per_second,
        )
        .await
    {
        state.metrics.record_rate_limited();
        return Err(ApiError::RateLimited {
            retry_after_seconds,
        });
    }

    match state
        .service
        .create_order_idempotent(&idempotency_key, &req)
        .await?
    {
        IdempotentCreateOutcome::Created { response, body } => Ok((
            StatusCode::CREATED,
            [
                (
                    header::LOCATION,
                    format!("/api/v1/orders/{}", response.order_id),
                ),
                (header::CONTENT_TYPE, "application/json".to_string()),
            ],
            body,
        )
            .into_response()),
        // 保存された status とボディを byte 単位そのままで返す（再エンコードしない）
        IdempotentCreateOutcome::Replay {
            response_code,
            body,
        } => Ok((
            StatusCode::from_u16(response_code).unwrap_or(StatusCode::OK),
            [(header::CONTENT_TYPE, "application/json".to_string())],
            body,
        )
            .into_response()),
    }
}

/// ID指定取得ハンドラ
///
/// GET /api/v1/orders/{orderId}
async fn handle_get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    if let TokenBucketDecision::Rejected {
        retry_after_seconds,
    } = state
        .limiter
        .try_consume(
            GET_ORDER_BUCKET,
            state.rate_settings.get_order_capacity,
            state.rate_settings.get_order_refill_per_second,
        )
        .await
    {
        state.metrics.record_rate_limited();
        return Err(ApiError::RateLimited {
            retry_after_seconds,
        });
    }

    match state.service.get_order(order_id).await? {
        Some(view) => Ok((StatusCode::OK, Json(view)).into_response()),
        // 不在は正常な空結果
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListOrdersParams {
    user_id: Option<String>,
    status: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
    sort: Option<String>,
    sort_dir: Option<String>,
}

/// 一覧ハンドラ
///
/// GET /api/v1/orders
async fn handle_list_orders(
    State(state): State<AppState>,
    Query(params): Query<ListOrdersParams>,
) -> Json<PageResponse<OrderView>> {
    let page = params.page.unwrap_or(0);
    let size = params
        .size
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);
    let sort = SortProperty::parse(params.sort.as_deref().unwrap_or("createdAt"));
    let descending = !params
        .sort_dir
        .as_deref()
        .map(|d| d.trim().eq_ignore_ascii_case("asc"))
        .unwrap_or(false);
    let status = params.status.as_deref().and_then(OrderStatus::parse);

    Json(state.service.list_orders(
        params.user_id.as_deref(),
        status,
        page,
        size,
        sort,
        descending,
    ))
}

/// ヘルスチェックレスポンス
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    orders: usize,
    available_create_permits: usize,
}

/// ヘルスチェックハンドラ
///
/// GET /health
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".into(),
        orders: state.service.order_count(),
        available_create_permits: state.admission.available(),
    })
}

/// メトリクスハンドラ
///
/// GET /metrics
/// Prometheus形式で出力
async fn handle_metrics(State(state): State<AppState>) -> String {
    state.metrics.render_prometheus()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSettings, InMemoryOrderCache};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::metrics::OrderMetrics;
    use crate::order::OrderItemRequest;
    use crate::repo::OrderRepository;
    use axum::http::HeaderValue;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn build_test_state(max_creates: usize, rate_settings: RateLimitSettings) -> AppState {
        let cache = InMemoryOrderCache::new(CacheSettings {
            ttl_min_sec: 60,
            ttl_max_sec: 60,
            lock_ttl_ms: 5_000,
            lock_miss_wait_ms: 20,
        });
        let metrics = Arc::new(AtomicOrderMetrics::new());
        let service = Arc::new(OrdersService::new(
            Arc::new(OrderRepository::new()),
            Arc::new(cache),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::clone(&metrics) as Arc<dyn OrderMetrics>,
        ));
        AppState::new(
            service,
            Arc::new(crate::ratelimit::InMemoryTokenBucket::new()),
            rate_settings,
            AdmissionSemaphore::new(max_creates),
            metrics,
        )
    }

    fn generous_rate() -> RateLimitSettings {
        RateLimitSettings {
            post_orders_capacity: 1_000,
            post_orders_refill_per_second: 1_000.0,
            get_order_capacity: 1_000,
            get_order_refill_per_second: 1_000.0,
        }
    }

    fn headers(idempotency_key: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = idempotency_key {
            headers.insert(
                IDEMPOTENCY_KEY_HEADER,
                HeaderValue::from_str(key).expect("idem header"),
            );
        }
        headers
    }

    fn order_request() -> CreateOrderRequest {
        CreateOrderRequest {
            user_id: "u1".into(),
            currency: "USD".into(),
            items: vec![OrderItemRequest {
                sku: "SKU-A".into(),
                qty: 1,
                unit_price: Decimal::from_str("10.00").unwrap(),
            }],
        }
    }

    #[tokio::test]
    async fn missing_or_blank_key_is_rejected_before_admission() {
        // 同時実行枠が0でも、キー検査が先に走って 400 で止まる
        let state = build_test_state(0, generous_rate());

        let err = handle_create_order(State(state.clone()), headers(None), Json(order_request()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MissingIdempotencyKey));

        let err = handle_create_order(
            State(state.clone()),
            headers(Some("   ")),
            Json(order_request()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::MissingIdempotencyKey));
        assert_eq!(state.service.order_count(), 0);
    }

    #[tokio::test]
    async fn invalid_body_is_rejected_without_state_change() {
        let state = build_test_state(8, generous_rate());
        let req = CreateOrderRequest {
            user_id: "u1".into(),
            currency: "USD".into(),
            items: Vec::new(),
        };

        let err = handle_create_order(State(state.clone()), headers(Some("k1")), Json(req))
            .await
            .unwrap_err();
        match err {
            ApiError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "items"));
            }
            other => panic!("expected Validation, got {:?}", other),
        }
        assert_eq!(state.service.order_count(), 0);
    }

    #[tokio::test]
    async fn create_returns_201_and_replay_returns_identical_bytes() {
        let state = build_test_state(8, generous_rate());

        let response = handle_create_order(
            State(state.clone()),
            headers(Some("k1")),
            Json(order_request()),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(location.starts_with("/api/v1/orders/"));
        let first_body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        // 同じキーの再送は保存済み応答を byte 単位そのままで返す
        let replay = handle_create_order(
            State(state.clone()),
            headers(Some("k1")),
            Json(order_request()),
        )
        .await
        .unwrap();
        assert_eq!(replay.status(), StatusCode::CREATED);
        let replay_body = axum::body::to_bytes(replay.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(first_body, replay_body);
        assert_eq!(state.service.order_count(), 1);
    }

    #[tokio::test]
    async fn saturated_create_path_returns_overloaded() {
        let state = build_test_state(0, generous_rate());

        let err = handle_create_order(
            State(state.clone()),
            headers(Some("k1")),
            Json(order_request()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Overloaded(_)));
        assert!(state
            .metrics
            .render_prometheus()
            .contains("overloaded_total 1"));
    }

    #[tokio::test]
    async fn rate_limited_get_carries_retry_after() {
        let state = build_test_state(
            8,
            RateLimitSettings {
                post_orders_capacity: 1_000,
                post_orders_refill_per_second: 1_000.0,
                get_order_capacity: 1,
                get_order_refill_per_second: 0.5,
            },
        );
        let order_id = Uuid::new_v4();

        // 1回目はトークンを消費して通る（不在なので404）
        let response = handle_get_order(State(state.clone()), Path(order_id))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let err = handle_get_order(State(state.clone()), Path(order_id))
            .await
            .unwrap_err();
        match err {
            ApiError::RateLimited {
                retry_after_seconds,
            } => assert!(retry_after_seconds >= 1),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn list_param_defaults() {
        assert_eq!(SortProperty::parse("createdAt"), SortProperty::CreatedAt);
        assert_eq!(SortProperty::parse("unknown"), SortProperty::CreatedAt);
        assert_eq!(SortProperty::parse("totalAmount"), SortProperty::TotalAmount);
    }
}
