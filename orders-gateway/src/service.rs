//! 注文サービス（コアフローの編成）
//!
//! - 作成: 冪等コーディネータ経由で高々1回だけ実行し、書き込み後は
//!   該当キャッシュを無効化する（書き込みからの直接移入はしない）
//! - 読み取り: キャッシュアサイド + 移入リースで真実の源への殺到を抑える
//! - 一覧: リポジトリへの素通し（ルーティンなグルー）

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{read_through, OrderCache};
use crate::clock::now_millis;
use crate::error::ApiError;
use crate::idempotency::coordinator::{IdempotencyCoordinator, IdempotentCreateOutcome};
use crate::idempotency::IdempotencyStore;
use crate::metrics::OrderMetrics;
use crate::order::{
    CreateOrderRequest, CreateOrderResponse, OrderItemView, OrderStatus, OrderView, PageResponse,
};
use crate::repo::{OrderRepository, SortProperty};

pub struct OrdersService {
    repo: Arc<OrderRepository>,
    cache: Arc<dyn OrderCache>,
    coordinator: IdempotencyCoordinator,
    metrics: Arc<dyn OrderMetrics>,
}

impl OrdersService {
    pub fn new(
        repo: Arc<OrderRepository>,
        cache: Arc<dyn OrderCache>,
        store: Arc<dyn IdempotencyStore>,
        metrics: Arc<dyn OrderMetrics>,
    ) -> Self {
        Self {
            repo,
            cache,
            coordinator: IdempotencyCoordinator::new(store, Arc::clone(&metrics)),
            metrics,
        }
    }

    /// 注文作成の実体。冪等制御はかけない（コーディネータの claim 勝者だけが呼ぶ）。
    pub async fn create_order(
        &self,
        request: &CreateOrderRequest,
    ) -> Result<CreateOrderResponse, ApiError> {
        let now = now_millis();
        let order_id = Uuid::new_v4();

        let mut total_amount = Decimal::ZERO;
        let mut items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let line_amount = item.unit_price * Decimal::from(item.qty);
            total_amount += line_amount;
            items.push(OrderItemView {
                sku: item.sku.clone(),
                qty: item.qty,
                unit_price: item.unit_price,
                line_amount,
            });
        }

        let view = OrderView {
            order_id,
            user_id: request.user_id.clone(),
            currency: request.currency.clone(),
            status: OrderStatus::Pending,
            total_amount,
            created_at: now,
            items,
        };
        debug!(%order_id, status = view.status.as_str(), total = %total_amount, "order persisted");
        self.repo.insert(view);
        self.metrics.record_order_created();

        // 書き込み後はキャッシュエントリを消すだけ。読み取り側が
        // リース制御の下で遅延再移入する
        self.cache.invalidate(order_id).await;

        Ok(CreateOrderResponse {
            order_id,
            status: OrderStatus::Pending,
            total_amount,
            created_at: now,
        })
    }

    /// 冪等キー付き注文作成。
    pub async fn create_order_idempotent(
        &self,
        idempotency_key: &str,
        request: &CreateOrderRequest,
    ) -> Result<IdempotentCreateOutcome, ApiError> {
        self.coordinator
            .create_order_idempotent(idempotency_key, request, || self.create_order(request))
            .await
    }

    /// ID指定の読み取り。キャッシュアサイド経由。不在はエラーではなく None。
    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderView>, ApiError> {
        let repo = Arc::clone(&self.repo);
        read_through(
            self.cache.as_ref(),
            self.metrics.as_ref(),
            order_id,
            move || Ok(repo.find(order_id)),
        )
        .await
    }

    pub fn list_orders(
        &self,
        user_id: Option<&str>,
        status: Option<OrderStatus>,
        page: u32,
        size: u32,
        sort: SortProperty,
        descending: bool,
    ) -> PageResponse<OrderView> {
        self.repo.list(user_id, status, page, size, sort, descending)
    }

    pub fn order_count(&self) -> usize {
        self.repo.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSettings, InMemoryOrderCache};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::metrics::NoopOrderMetrics;
    use crate::order::OrderItemRequest;
    use std::collections::HashSet;
    use std::str::FromStr;

    fn service() -> Arc<OrdersService> {
        let cache = InMemoryOrderCache::new(CacheSettings {
            ttl_min_sec: 60,
            ttl_max_sec: 60,
            lock_ttl_ms: 5_000,
            lock_miss_wait_ms: 20,
        });
        Arc::new(OrdersService::new(
            Arc::new(OrderRepository::new()),
            Arc::new(cache),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(NoopOrderMetrics),
        ))
    }

    fn request(sku: &str, qty: u32, unit_price: &str) -> CreateOrderRequest {
        CreateOrderRequest {
            user_id: "u1".into(),
            currency: "USD".into(),
            items: vec![OrderItemRequest {
                sku: sku.into(),
                qty,
                unit_price: Decimal::from_str(unit_price).unwrap(),
            }],
        }
    }

    #[tokio::test]
    async fn totals_are_derived_from_the_lines() {
        let service = service();
        let req = CreateOrderRequest {
            user_id: "u1".into(),
            currency: "USD".into(),
            items: vec![
                OrderItemRequest {
                    sku: "SKU-A".into(),
                    qty: 2,
                    unit_price: Decimal::from_str("10.50").unwrap(),
                },
                OrderItemRequest {
                    sku: "SKU-B".into(),
                    qty: 1,
                    unit_price: Decimal::from_str("5.25").unwrap(),
                },
            ],
        };

        let response = service.create_order(&req).await.unwrap();
        assert_eq!(response.total_amount, Decimal::from_str("26.25").unwrap());
        assert_eq!(response.status, OrderStatus::Pending);

        let view = service.get_order(response.order_id).await.unwrap().unwrap();
        assert_eq!(view.items.len(), 2);
        assert_eq!(
            view.items[0].line_amount,
            Decimal::from_str("21.00").unwrap()
        );
    }

    #[tokio::test]
    async fn same_key_same_payload_returns_the_same_order() {
        let service = service();
        let req = request("SKU-A", 2, "10.00");

        let first = service
            .create_order_idempotent("idem-1", &req)
            .await
            .unwrap();
        let order_id = match first {
            IdempotentCreateOutcome::Created { response, .. } => response.order_id,
            other => panic!("expected Created, got {:?}", other),
        };

        // 表記揺れ（明細順・小数の末尾ゼロ）は同じリクエストとして扱われる
        let retry = request("SKU-A", 2, "10.0");
        match service
            .create_order_idempotent("idem-1", &retry)
            .await
            .unwrap()
        {
            IdempotentCreateOutcome::Replay {
                response_code,
                body,
            } => {
                assert_eq!(response_code, 201);
                assert!(body.contains(&order_id.to_string()));
            }
            other => panic!("expected Replay, got {:?}", other),
        }

        assert_eq!(service.order_count(), 1);
    }

    #[tokio::test]
    async fn same_key_different_payload_conflicts() {
        let service = service();
        service
            .create_order_idempotent("idem-1", &request("SKU-A", 1, "10.00"))
            .await
            .unwrap();

        let err = service
            .create_order_idempotent("idem-1", &request("SKU-B", 1, "10.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::IdempotencyConflict(_)));
        assert_eq!(service.order_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_duplicates_collapse_to_one_order() {
        let service = service();
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                let req = request("SKU-A", 2, "10.00");
                barrier.wait().await;
                service.create_order_idempotent("idem-race", &req).await
            }));
        }

        let mut created = 0;
        let mut order_ids: HashSet<String> = HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(IdempotentCreateOutcome::Created { response, .. }) => {
                    created += 1;
                    order_ids.insert(response.order_id.to_string());
                }
                Ok(IdempotentCreateOutcome::Replay { body, .. }) => {
                    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
                    order_ids.insert(value["orderId"].as_str().unwrap().to_string());
                }
                // claim に負けて勝者の確定前に覗いた呼び出しだけが受け取る
                Err(ApiError::IdempotencyStillProcessing) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(order_ids.len(), 1);
        assert_eq!(service.order_count(), 1);
    }

    #[tokio::test]
    async fn read_after_write_sees_the_new_order() {
        let service = service();
        let response = service
            .create_order(&request("SKU-A", 1, "10.00"))
            .await
            .unwrap();

        // 1回目はミスして移入、2回目はキャッシュヒット。どちらも同じ内容
        let first = service.get_order(response.order_id).await.unwrap().unwrap();
        let second = service.get_order(response.order_id).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.order_id, response.order_id);
    }

    #[tokio::test]
    async fn missing_order_is_none_not_an_error() {
        let service = service();
        assert!(service.get_order(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_pages_by_user() {
        let service = service();
        for _ in 0..3 {
            service
                .create_order(&request("SKU-A", 1, "10.00"))
                .await
                .unwrap();
        }

        let page = service.list_orders(Some("u1"), None, 0, 2, SortProperty::CreatedAt, true);
        assert_eq!(page.total_elements, 3);
        assert_eq!(page.content.len(), 2);
        let empty = service.list_orders(Some("nobody"), None, 0, 2, SortProperty::CreatedAt, true);
        assert_eq!(empty.total_elements, 0);
    }
}
