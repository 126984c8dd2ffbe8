//! 注文リポジトリ（真実の源）
//!
//! 注文スナップショットをメモリ内で管理する。本コアから見ると
//! 永続層は外部コラボレータで、ここはその最小実装。

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::order::{OrderStatus, OrderView, PageResponse};

/// 一覧のソート対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortProperty {
    CreatedAt,
    TotalAmount,
}

impl SortProperty {
    /// 未知のプロパティは既定の createdAt に落とす
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "totalAmount" => Self::TotalAmount,
            _ => Self::CreatedAt,
        }
    }
}

/// インメモリ注文ストア
pub struct OrderRepository {
    orders: RwLock<HashMap<Uuid, OrderView>>,
}

impl OrderRepository {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, order: OrderView) {
        self.orders
            .write()
            .unwrap()
            .insert(order.order_id, order);
    }

    pub fn find(&self, order_id: Uuid) -> Option<OrderView> {
        self.orders
            .read()
            .unwrap()
            .get(&order_id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.orders
            .read()
            .unwrap()
            .len()
    }

    /// フィルタ + ソート + ページングの一覧取得。
    pub fn list(
        &self,
        user_id: Option<&str>,
        status: Option<OrderStatus>,
        page: u32,
        size: u32,
        sort: SortProperty,
        descending: bool,
    ) -> PageResponse<OrderView> {
        let guard = self.orders.read().unwrap();
        let mut rows: Vec<&OrderView> = guard
            .values()
            .filter(|o| user_id.map_or(true, |u| o.user_id == u))
            .filter(|o| status.map_or(true, |s| o.status == s))
            .collect();

        rows.sort_by(|a, b| {
            let ordering = match sort {
                SortProperty::CreatedAt => a.created_at.cmp(&b.created_at),
                SortProperty::TotalAmount => a.total_amount.cmp(&b.total_amount),
            };
            // 同値は order_id で安定させる
            let ordering = ordering.then_with(|| a.order_id.cmp(&b.order_id));
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let total_elements = rows.len() as u64;
        let size = size.max(1);
        let total_pages = (total_elements + size as u64 - 1) / size as u64;
        let start = page as usize * size as usize;
        let content: Vec<OrderView> = rows
            .into_iter()
            .skip(start)
            .take(size as usize)
            .cloned()
            .collect();

        PageResponse {
            content,
            total_elements,
            total_pages,
            number: page,
            size,
            first: page == 0,
            last: total_pages == 0 || (page as u64 + 1) >= total_pages,
        }
    }
}

impl Default for OrderRepository {
    fn default() -> Self {
        Self::new()
    }
}
