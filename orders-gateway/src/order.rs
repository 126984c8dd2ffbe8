//! 注文関連の型定義
//!
//! HTTPリクエスト/レスポンスとキャッシュ投影で使用する構造体。

use orders_core::CanonicalItem;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FieldError;

/// 注文ステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// 文字列からのパース。未知の値は None（検索条件としては無視される）。
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PAID" => Some(Self::Paid),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// 注文作成リクエスト（HTTPボディ）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: String,
    pub currency: String,
    #[serde(default)]
    pub items: Vec<OrderItemRequest>,
}

/// 注文明細1行分のリクエスト
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    pub sku: String,
    pub qty: u32,
    pub unit_price: Decimal,
}

impl CreateOrderRequest {
    /// 入口バリデーション。状態変更の前に必ず通す。
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.user_id.trim().is_empty() {
            errors.push(FieldError::new("userId", "userId must not be blank"));
        }
        if self.currency.trim().is_empty() {
            errors.push(FieldError::new("currency", "currency must not be blank"));
        } else if self.currency.trim().len() > 3 {
            errors.push(FieldError::new(
                "currency",
                "currency must be at most 3 characters",
            ));
        }
        if self.items.is_empty() {
            errors.push(FieldError::new("items", "items must not be empty"));
        }
        for (i, item) in self.items.iter().enumerate() {
            if item.sku.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("items[{}].sku", i),
                    "sku must not be blank",
                ));
            }
            if item.qty < 1 {
                errors.push(FieldError::new(
                    format!("items[{}].qty", i),
                    "qty must be at least 1",
                ));
            }
            if item.unit_price <= Decimal::ZERO {
                errors.push(FieldError::new(
                    format!("items[{}].unitPrice", i),
                    "unitPrice must be greater than 0",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// 冪等性判定に使う正規化ダイジェスト。
    /// 明細順や小数表記の揺れは同一視される。
    pub fn canonical_hash(&self) -> String {
        let items: Vec<CanonicalItem<'_>> = self
            .items
            .iter()
            .map(|item| CanonicalItem {
                sku: item.sku.as_str(),
                qty: item.qty,
                unit_price: item.unit_price,
            })
            .collect();
        orders_core::request_hash(&self.user_id, &self.currency, &items)
    }
}

/// 注文作成レスポンス
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub created_at: u64,
}

/// 注文の非正規化ビュー（読み取りモデル。キャッシュにもこの形で載る）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order_id: Uuid,
    pub user_id: String,
    pub currency: String,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub created_at: u64,
    pub items: Vec<OrderItemView>,
}

/// 明細1行分のビュー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub sku: String,
    pub qty: u32,
    pub unit_price: Decimal,
    pub line_amount: Decimal,
}

/// ページング付き一覧レスポンス
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub content: Vec<T>,
    pub total_elements: u64,
    pub total_pages: u64,
    pub number: u32,
    pub size: u32,
    pub first: bool,
    pub last: bool,
}
